use std::time::Duration;

use async_trait::async_trait;
use execgate_agent::{AgentTask, ExecutorAdapter};
use execgate_core::errors::Fault;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts agent tasks as JSON to the resolved executor endpoint.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    auth_token: Option<SecretString>,
}

impl HttpExecutor {
    pub fn new(client: Client, auth_token: Option<SecretString>) -> Self {
        Self { client, auth_token }
    }

    pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
        Client::builder().timeout(timeout).build()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

fn transport_fault(error: reqwest::Error) -> Fault {
    if error.is_timeout() {
        Fault::timeout(format!("agent endpoint timed out: {error}"))
    } else {
        Fault::integration(format!("agent endpoint request failed: {error}"))
    }
}

#[async_trait]
impl ExecutorAdapter for HttpExecutor {
    async fn execute(&self, target: &str, task: &AgentTask) -> Result<Value, Fault> {
        let response = self
            .authorize(self.client.post(target).json(task))
            .send()
            .await
            .map_err(transport_fault)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Fault::integration(format!(
                "agent endpoint returned {status}: {}",
                body.trim()
            )));
        }

        response
            .json::<Value>()
            .await
            .map_err(|error| Fault::integration(format!("agent response is not JSON: {error}")))
    }

    async fn probe(&self, target: &str) -> Result<(), Fault> {
        let response =
            self.authorize(self.client.get(target)).send().await.map_err(transport_fault)?;

        // Anything short of a server error means the endpoint is up.
        if response.status().is_server_error() {
            return Err(Fault::integration(format!(
                "agent probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
