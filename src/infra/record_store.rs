//! HTTP adapter for the external record store.
//!
//! The store is addressed as a REST collection: a record is updated with
//! `PATCH {endpoint}/{record_id}` and the attachment is written into a
//! configurable field as a `[{url, filename}]` list. The store downloads the
//! file from the public URL on its own schedule.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;

use crate::{
    application::uploads::{AttachmentRef, RecordStore, RecordStoreError},
    config::RecordStoreSettings,
    domain::jobs::RecordId,
};

use super::error::InfraError;

#[derive(Debug, Serialize)]
struct AttachmentPatch<'a> {
    fields: BTreeMap<&'a str, Vec<AttachmentEntry<'a>>>,
}

#[derive(Debug, Serialize)]
struct AttachmentEntry<'a> {
    url: &'a str,
    filename: &'a str,
}

#[derive(Clone, Debug)]
pub struct HttpRecordStore {
    client: Client,
    endpoint: Url,
    api_token: String,
    attachment_field: String,
}

impl HttpRecordStore {
    pub fn new(settings: &RecordStoreSettings) -> Result<Self, InfraError> {
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or_else(|| InfraError::configuration("record_store.endpoint is required"))?;
        let api_token = settings
            .api_token
            .clone()
            .ok_or_else(|| InfraError::configuration("record_store.api_token is required"))?;

        // The coordinator enforces the upload sub-deadline; this only guards
        // against connections that never resolve.
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .connect_timeout(settings.timeout)
            .build()
            .map_err(|err| {
                InfraError::configuration(format!("failed to build record store client: {err}"))
            })?;

        Ok(Self {
            client,
            endpoint,
            api_token,
            attachment_field: settings.attachment_field.clone(),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("pressroom/", env!("CARGO_PKG_VERSION"))
    }

    fn record_url(&self, record_id: &RecordId) -> Result<Url, RecordStoreError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| RecordStoreError::Transport("endpoint cannot hold a path".to_string()))?
            .pop_if_empty()
            .push(record_id.as_str());
        Ok(url)
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn attach(
        &self,
        record_id: &RecordId,
        attachment: &AttachmentRef,
    ) -> Result<(), RecordStoreError> {
        let url = self.record_url(record_id)?;
        let mut fields = BTreeMap::new();
        fields.insert(
            self.attachment_field.as_str(),
            vec![AttachmentEntry {
                url: attachment.url.as_str(),
                filename: attachment.file_name.as_str(),
            }],
        );

        let response = self
            .client
            .patch(url)
            .bearer_auth(&self.api_token)
            .json(&AttachmentPatch { fields })
            .send()
            .await
            .map_err(|err| RecordStoreError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RecordStoreError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
