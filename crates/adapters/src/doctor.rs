//! Doctor is the authoritative source for planned maintenances. Its
//! adapter polls the full snapshot and resolves display names for each
//! maintenance's CRNs.

use models::{ChangeKind, Crn, IngestMessage, NotificationType, TranslatedText};
use serde::Deserialize;

use crate::names::{CatalogClient, NameResolver};

#[derive(Debug, Deserialize)]
struct DoctorMaintenance {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    crns: Vec<String>,
    #[serde(default)]
    planned_start: Option<String>,
    #[serde(default)]
    planned_end: Option<String>,
    #[serde(default)]
    created: Option<String>,
    updated: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DoctorSnapshot {
    #[serde(default)]
    items: Vec<DoctorMaintenance>,
}

pub struct DoctorAdapter<C> {
    client: reqwest::Client,
    base_url: String,
    resolver: NameResolver<C>,
}

impl<C: CatalogClient> DoctorAdapter<C> {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        resolver: NameResolver<C>,
    ) -> Self {
        DoctorAdapter {
            client,
            base_url: base_url.into(),
            resolver,
        }
    }

    async fn display_names(&self, maintenance: &DoctorMaintenance) -> Vec<TranslatedText> {
        // One name set per maintenance, resolved from its first parseable CRN.
        for crn_full in &maintenance.crns {
            if let Ok(crn) = crn_full.parse::<Crn>() {
                return self.resolver.display_names(&crn, &maintenance.category).await;
            }
        }
        Vec::new()
    }
}

#[async_trait::async_trait]
impl<C: CatalogClient> crate::Adapter for DoctorAdapter<C> {
    fn source(&self) -> &'static str {
        "doctor"
    }

    async fn fetch(&self) -> anyhow::Result<Vec<IngestMessage>> {
        use anyhow::Context;

        let url = format!("{}/api/v1/maintenances", self.base_url);
        let snapshot: DoctorSnapshot = self
            .client
            .get(&url)
            .send()
            .await
            .context("fetching doctor maintenances")?
            .error_for_status()
            .context("doctor answered with an error status")?
            .json()
            .await
            .context("parsing doctor maintenance snapshot")?;

        let mut messages = Vec::with_capacity(snapshot.items.len());
        for item in snapshot.items {
            let resource_display_names = self.display_names(&item).await;
            messages.push(IngestMessage {
                kind: ChangeKind::Update,
                source: "doctor".to_string(),
                source_id: item.id,
                notification_type: NotificationType::Maintenance,
                category: item.category,
                incident_id: None,
                crns: item.crns,
                short_description: item.title,
                long_description: item.description,
                event_time_start: item.planned_start,
                event_time_end: item.planned_end,
                source_creation_time: item.created,
                source_update_time: item.updated,
                tags: item.tags,
                resource_display_names,
                pnp_removed: false,
            });
        }
        Ok(messages)
    }
}
