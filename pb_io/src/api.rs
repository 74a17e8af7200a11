use std::sync::Arc;

use pb_core::{Error, Formula};

use crate::traits::{HttpClient, ReqwestHttpClient};

pub const DEFAULT_API_URL: &str = "https://formulae.brew.sh/api/formula";

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Arc<dyn HttpClient>,
}

impl ApiClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_API_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self::with_http(base_url, Arc::new(ReqwestHttpClient::new()))
    }

    pub fn with_http(base_url: String, http: Arc<dyn HttpClient>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub async fn get_formula(&self, name: &str) -> Result<Formula, Error> {
        let url = format!("{}/{}.json", self.base_url, name);
        let response = self.http.get(&url).await?;

        if response.status == 404 {
            return Err(Error::MissingFormula {
                name: name.to_string(),
            });
        }
        if !response.is_success() {
            return Err(Error::network(format!(
                "HTTP {} fetching formula '{name}'",
                response.status
            )));
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| Error::network(format!("failed to parse formula JSON for '{name}': {e}")))
    }
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{HttpResponse, MockHttpClient};
    use mockall::predicate::eq;

    fn client_with(mock: MockHttpClient) -> ApiClient {
        ApiClient::with_http("https://api.test/formula/".to_string(), Arc::new(mock))
    }

    #[tokio::test]
    async fn fetches_and_parses_formula() {
        let mut mock = MockHttpClient::new();
        mock.expect_get()
            .with(eq("https://api.test/formula/jq.json"))
            .times(1)
            .returning(|_| {
                Ok(HttpResponse {
                    status: 200,
                    body: br#"{"name":"jq","versions":{"stable":"1.7.1"}}"#.to_vec(),
                })
            });

        let formula = client_with(mock).get_formula("jq").await.unwrap();
        assert_eq!(formula.name, "jq");
        assert_eq!(formula.versions.stable, "1.7.1");
    }

    #[tokio::test]
    async fn not_found_is_missing_formula() {
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(|_| {
            Ok(HttpResponse {
                status: 404,
                body: Vec::new(),
            })
        });

        let err = client_with(mock).get_formula("nope").await.unwrap_err();
        assert_eq!(
            err,
            Error::MissingFormula {
                name: "nope".to_string()
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_network_failure() {
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(|_| {
            Ok(HttpResponse {
                status: 503,
                body: Vec::new(),
            })
        });

        let err = client_with(mock).get_formula("jq").await.unwrap_err();
        assert!(matches!(err, Error::NetworkFailure { ref message } if message.contains("503")));
    }

    #[tokio::test]
    async fn garbage_body_is_network_failure() {
        let mut mock = MockHttpClient::new();
        mock.expect_get().returning(|_| {
            Ok(HttpResponse {
                status: 200,
                body: b"<html>".to_vec(),
            })
        });

        let err = client_with(mock).get_formula("jq").await.unwrap_err();
        assert!(err.is_transient());
    }
}
