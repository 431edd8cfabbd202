//! Pushover delivery channel
//!
//! Posts alerts to the Pushover message API with the configured
//! application token and user key.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::config::PushoverConfig;

use super::dispatcher::{AlertChannel, NotifyError};

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

pub struct PushoverChannel {
    config: PushoverConfig,
    client: Client,
}

#[derive(Serialize)]
struct PushoverRequest<'a> {
    token: &'a str,
    user: &'a str,
    title: &'a str,
    message: &'a str,
}

impl PushoverChannel {
    pub fn new(config: PushoverConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for PushoverChannel {
    fn name(&self) -> &'static str {
        "pushover"
    }

    async fn deliver(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(PUSHOVER_API_URL)
            .json(&PushoverRequest {
                token: &self.config.token,
                user: &self.config.user,
                title,
                message,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
