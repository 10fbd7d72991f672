//! Display-name resolution for inbound CRNs. Order: per-resource catalog
//! overview, then the OSS catalog record for the category, then the manual
//! name map, then a normalized form of the service name itself.

use std::collections::HashMap;
use std::sync::RwLock;

use models::{Crn, TranslatedText};

/// The catalog lookup is an external collaborator; only its contract lives
/// here.
#[async_trait::async_trait]
pub trait CatalogClient: Send + Sync {
    /// Translated display names for one resource, in the requested languages.
    async fn resource_overview(
        &self,
        crn: &Crn,
        languages: &[String],
    ) -> anyhow::Result<Vec<TranslatedText>>;

    /// Display name of the catalog record behind a category id.
    async fn record_by_category(&self, category_id: &str) -> anyhow::Result<Option<String>>;
}

pub struct NameResolver<C> {
    catalog: C,
    manual: HashMap<String, String>,
    languages: Vec<String>,
    /// Memoized lookups; read-mostly, so readers never block each other.
    resolved: RwLock<HashMap<String, Vec<TranslatedText>>>,
}

impl<C: CatalogClient> NameResolver<C> {
    pub fn new(catalog: C, manual: HashMap<String, String>, languages: Vec<String>) -> Self {
        NameResolver {
            catalog,
            manual,
            languages,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve display names for a CRN. Lookup failures degrade to the next
    /// source; the normalized service name is the guaranteed fallback.
    pub async fn display_names(&self, crn: &Crn, category_id: &str) -> Vec<TranslatedText> {
        let cache_key = format!("{crn}|{category_id}");
        if let Some(names) = self.resolved.read().unwrap().get(&cache_key) {
            return names.clone();
        }

        let names = self.resolve(crn, category_id).await;
        self.resolved
            .write()
            .unwrap()
            .insert(cache_key, names.clone());
        names
    }

    async fn resolve(&self, crn: &Crn, category_id: &str) -> Vec<TranslatedText> {
        match self.catalog.resource_overview(crn, &self.languages).await {
            Ok(names) if !names.is_empty() => return names,
            Ok(_) => {}
            Err(error) => {
                tracing::debug!(crn = %crn, %error, "catalog overview lookup failed");
            }
        }

        if !category_id.is_empty() {
            match self.catalog.record_by_category(category_id).await {
                Ok(Some(name)) => return vec![TranslatedText::en(name)],
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(%category_id, %error, "catalog record lookup failed");
                }
            }
        }

        let service = crn.service_name();
        if let Some(name) = self.manual.get(service) {
            return vec![TranslatedText::en(name)];
        }
        vec![TranslatedText::en(normalize_service_name(service))]
    }
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to a
/// single `-`. Deterministic and idempotent.
pub fn normalize_service_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// OSS catalog over HTTP.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalog {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> HttpCatalog {
        HttpCatalog {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl CatalogClient for HttpCatalog {
    async fn resource_overview(
        &self,
        crn: &Crn,
        languages: &[String],
    ) -> anyhow::Result<Vec<TranslatedText>> {
        #[derive(serde::Deserialize)]
        struct Overview {
            #[serde(default)]
            display_names: Vec<TranslatedText>,
        }

        let url = format!("{}/api/v1/resources/overview", self.base_url);
        let overview: Overview = self
            .client
            .get(&url)
            .query(&[("crn", crn.to_string()), ("languages", languages.join(","))])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(overview.display_names)
    }

    async fn record_by_category(&self, category_id: &str) -> anyhow::Result<Option<String>> {
        #[derive(serde::Deserialize)]
        struct Record {
            #[serde(default)]
            display_name: Option<String>,
        }

        let url = format!("{}/api/v1/catalog/{category_id}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let record: Record = response.error_for_status()?.json().await?;
        Ok(record.display_name)
    }
}

/// The manual name map lives in external storage as a flat JSON object of
/// service name to display name.
pub async fn load_manual_map(
    client: &reqwest::Client,
    url: Option<&str>,
) -> anyhow::Result<HashMap<String, String>> {
    let Some(url) = url else {
        return Ok(HashMap::new());
    };
    let map = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(map)
}

#[cfg(test)]
mod test {
    use super::*;

    struct EmptyCatalog;

    #[async_trait::async_trait]
    impl CatalogClient for EmptyCatalog {
        async fn resource_overview(
            &self,
            _crn: &Crn,
            _languages: &[String],
        ) -> anyhow::Result<Vec<TranslatedText>> {
            Ok(vec![])
        }

        async fn record_by_category(&self, _category_id: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_normalize_service_name() {
        assert_eq!(normalize_service_name("Cloudant NoSQL DB"), "cloudant-nosql-db");
        assert_eq!(normalize_service_name("already-normal"), "already-normal");
        assert_eq!(normalize_service_name("  Spaces  "), "spaces");
        assert_eq!(normalize_service_name("a__b..c"), "a-b-c");
    }

    #[test]
    fn test_normalize_service_name_is_idempotent() {
        for raw in ["Cloudant NoSQL DB", "Watson/Discovery (v2)", "x"] {
            let once = normalize_service_name(raw);
            assert_eq!(normalize_service_name(&once), once);
        }
    }

    #[tokio::test]
    async fn test_resolution_falls_through_to_manual_map() {
        let manual = HashMap::from([("svc".to_string(), "My Service".to_string())]);
        let resolver = NameResolver::new(EmptyCatalog, manual, vec!["en".to_string()]);
        let crn: Crn = "crn:v1:bluemix:public:svc:us-south::::".parse().unwrap();

        let names = resolver.display_names(&crn, "cat-1").await;
        assert_eq!(names, vec![TranslatedText::en("My Service")]);
    }

    #[tokio::test]
    async fn test_lookups_are_memoized() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingCatalog(AtomicUsize);

        #[async_trait::async_trait]
        impl CatalogClient for CountingCatalog {
            async fn resource_overview(
                &self,
                _crn: &Crn,
                _languages: &[String],
            ) -> anyhow::Result<Vec<TranslatedText>> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(vec![TranslatedText::en("Cloudant")])
            }

            async fn record_by_category(&self, _: &str) -> anyhow::Result<Option<String>> {
                Ok(None)
            }
        }

        let resolver = NameResolver::new(
            CountingCatalog(AtomicUsize::new(0)),
            HashMap::new(),
            vec!["en".to_string()],
        );
        let crn: Crn = "crn:v1:bluemix:public:svc:us-south::::".parse().unwrap();

        assert_eq!(resolver.display_names(&crn, "cat").await.len(), 1);
        assert_eq!(resolver.display_names(&crn, "cat").await.len(), 1);
        assert_eq!(resolver.catalog.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolution_falls_back_to_normalized_service_name() {
        let resolver = NameResolver::new(EmptyCatalog, HashMap::new(), vec!["en".to_string()]);
        let crn: Crn = "crn:v1:bluemix:public:My Service:us-south::::".parse().unwrap();

        let names = resolver.display_names(&crn, "").await;
        assert_eq!(names, vec![TranslatedText::en("my-service")]);
    }
}
