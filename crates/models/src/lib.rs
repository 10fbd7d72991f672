mod crn;
mod message;
mod notification;
mod subscription;
mod time;

pub use crn::{Crn, CrnError};
pub use message::{ChangeKind, FanoutMessage, IngestMessage, RawEnvelope, TranslatedText};
pub use notification::{Notification, NotificationType, RecordId};
pub use subscription::{Subscription, Watch, WatchKind};
pub use time::{canonicalize, compare_source_times, normalize};
