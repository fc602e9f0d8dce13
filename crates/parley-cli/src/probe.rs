//! Provider reachability probe.
//!
//! Before the console starts we ask the chat provider which models it
//! serves, both to fail fast when the endpoint is down and to warn when the
//! configured model is not among them. Ollama-style endpoints answer on
//! `/api/tags`; OpenAI-compatible ones on `/v1/models`.

use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Fetch the list of models the provider serves.
///
/// Tries the Ollama `/api/tags` shape first, then the OpenAI `/v1/models`
/// shape. Returns an error only when neither endpoint answers.
pub fn fetch_models(base_url: &str, api_key: &str) -> Result<Vec<String>, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

    let tags_url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    if let Ok(resp) = client.get(&tags_url).send()
        && resp.status().is_success()
        && let Ok(tags) = resp.json::<TagsResponse>()
    {
        return Ok(tags.models.into_iter().map(|m| m.name).collect());
    }

    let models_url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let mut req = client.get(&models_url);
    if !api_key.is_empty() {
        req = req.bearer_auth(api_key);
    }
    let resp = req
        .send()
        .map_err(|e| format!("Provider unreachable at {}: {}", base_url, e))?;
    if !resp.status().is_success() {
        return Err(format!(
            "Provider at {} answered with status {}",
            base_url,
            resp.status()
        ));
    }
    let models = resp
        .json::<ModelsResponse>()
        .map_err(|e| format!("Provider answered with an unexpected body: {}", e))?;
    Ok(models.data.into_iter().map(|m| m.id).collect())
}

/// True when the provider answers at all.
pub fn is_running(base_url: &str, api_key: &str) -> bool {
    fetch_models(base_url, api_key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_host_reports_error() {
        // Port 1 is reserved and nothing listens there.
        let result = fetch_models("http://127.0.0.1:1", "");
        assert!(result.is_err());
        assert!(!is_running("http://127.0.0.1:1", ""));
    }

    #[test]
    fn tags_shape_deserializes() {
        let raw = r#"{"models":[{"name":"llama3"},{"name":"mistral"}]}"#;
        let tags: TagsResponse = serde_json::from_str(raw).expect("parse");
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["llama3", "mistral"]);
    }

    #[test]
    fn openai_shape_deserializes() {
        let raw = r#"{"object":"list","data":[{"id":"gpt-4o"},{"id":"gpt-4o-mini"}]}"#;
        let models: ModelsResponse = serde_json::from_str(raw).expect("parse");
        let ids: Vec<String> = models.data.into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["gpt-4o", "gpt-4o-mini"]);
    }
}
