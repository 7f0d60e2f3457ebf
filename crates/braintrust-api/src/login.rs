use braintrust_types::LoginResponse;
use serde_json::json;

use crate::{Client, Result};

impl Client {
    /// Exchange the API key for the organizations it can access.
    ///
    /// The client must be bound to the app URL, not the API URL.
    pub async fn login(&self) -> Result<LoginResponse> {
        self.post("/api/apikey/login", &json!({ "token": self.api_key }))
            .await
    }
}
