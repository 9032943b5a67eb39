//! Executor for CallApi nodes: request assembly, dispatch, response mapping.

use crate::domain::flow_definition::{
    ApiAuth, ApiBody, ApiKeyLocation, ApiRequest, CallApiData, Handle, KeyValuePair,
};
use crate::executors::{NodeContext, NodeOutcome};
use crate::{interpolate, response_path, ApiCallBody, ApiCallRequest, EngineError};
use serde_json::Value;
use std::collections::HashMap;

pub(super) async fn call_api(
    data: &CallApiData,
    ctx: &mut NodeContext<'_>,
) -> Result<NodeOutcome, EngineError> {
    let request = match assemble(&data.api_request, &ctx.execution.variables) {
        Ok(request) => request,
        Err(reason) => return Ok(NodeOutcome::Fail(reason)),
    };

    tracing::info!(
        execution_id = %ctx.execution.id,
        method = %request.method,
        url = %request.url,
        "Dispatching API call"
    );

    let response = match ctx.api.execute(request).await {
        Ok(response) => response,
        Err(err) => {
            return Ok(NodeOutcome::Fail(format!("API call failed: {}", err)));
        }
    };

    if !response.is_success() {
        return Ok(NodeOutcome::Fail(format!(
            "API call returned status {}",
            response.status
        )));
    }

    for mapping in &data.api_request.response_mappings {
        match response_path::extract(&response.body, &mapping.path) {
            Some(value) => {
                ctx.execution.set_variable(&mapping.variable, value.clone());
            }
            None => {
                tracing::debug!(
                    execution_id = %ctx.execution.id,
                    variable = %mapping.variable,
                    path = %mapping.path,
                    "Response path not found, leaving variable unset"
                );
            }
        }
    }

    if let Some(variable) = &data.api_request.response_variable {
        ctx.execution.set_variable(variable, response.to_envelope());
    }

    Ok(NodeOutcome::Next(Handle::Main))
}

/// Build the outgoing request, interpolating every configured string.
/// Returns a failure reason instead of an error: a bad request configuration
/// fails the execution, not the engine.
fn assemble(
    config: &ApiRequest,
    variables: &HashMap<String, Value>,
) -> Result<ApiCallRequest, String> {
    let url = interpolate::render(&config.url, variables);
    let mut query = render_pairs(&config.params, variables);
    let mut headers = render_pairs(&config.headers, variables);
    let mut basic_auth = None;

    match &config.auth {
        ApiAuth::None => {}
        ApiAuth::Bearer { token } => {
            let token = interpolate::render(token, variables);
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }
        ApiAuth::ApiKey {
            key,
            value,
            location,
        } => {
            let key = interpolate::render(key, variables);
            let value = interpolate::render(value, variables);
            match location {
                ApiKeyLocation::Header => headers.push((key, value)),
                ApiKeyLocation::Query => query.push((key, value)),
            }
        }
        ApiAuth::Basic { username, password } => {
            basic_auth = Some((
                interpolate::render(username, variables),
                interpolate::render(password, variables),
            ));
        }
    }

    let body = match &config.body {
        ApiBody::None => None,
        ApiBody::FormData { form_data } => Some(ApiCallBody::Form(render_pairs(form_data, variables))),
        ApiBody::Json { json } => {
            let rendered = interpolate::render(json, variables);
            let value: Value = serde_json::from_str(&rendered)
                .map_err(|e| format!("Request body is not valid JSON after interpolation: {}", e))?;
            Some(ApiCallBody::Json(value))
        }
    };

    Ok(ApiCallRequest {
        method: config.method,
        url,
        query,
        headers,
        basic_auth,
        body,
    })
}

fn render_pairs(
    pairs: &[KeyValuePair],
    variables: &HashMap<String, Value>,
) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter(|p| p.enabled)
        .map(|p| {
            (
                interpolate::render(&p.key, variables),
                interpolate::render(&p.value, variables),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow_definition::{HttpMethod, ResponseMapping};
    use crate::executors::test_support::*;
    use serde_json::json;

    fn request(url: &str) -> ApiRequest {
        ApiRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            params: vec![],
            headers: vec![],
            auth: ApiAuth::None,
            body: ApiBody::None,
            response_mappings: vec![],
            response_variable: None,
        }
    }

    fn pair(key: &str, value: &str, enabled: bool) -> KeyValuePair {
        KeyValuePair {
            key: key.to_string(),
            value: value.to_string(),
            enabled,
        }
    }

    #[tokio::test]
    async fn test_successful_call_maps_response() {
        let mut execution = test_execution();
        let transport = MockTransport::default();
        let api = MockApiClient::responding(200, json!({"data": {"balance": 42}}));

        let mut config = request("https://api.example.com/balance");
        config.response_mappings = vec![ResponseMapping {
            variable: "bal".to_string(),
            path: "data.balance".to_string(),
        }];
        config.response_variable = Some("apiResult".to_string());
        let data = CallApiData {
            api_request: config,
        };

        let mut ctx = NodeContext {
            execution: &mut execution,
            transport: &transport,
            api: &api,
        };
        let outcome = call_api(&data, &mut ctx).await.unwrap();

        assert_eq!(outcome, NodeOutcome::Next(Handle::Main));
        assert_eq!(execution.variables.get("bal"), Some(&json!(42)));
        let envelope = execution.variables.get("apiResult").unwrap();
        assert_eq!(envelope["status"], json!(200));
        assert_eq!(envelope["body"]["data"]["balance"], json!(42));
    }

    #[tokio::test]
    async fn test_missing_response_path_leaves_variable_unset() {
        let mut execution = test_execution();
        let transport = MockTransport::default();
        let api = MockApiClient::responding(200, json!({"data": {}}));

        let mut config = request("https://api.example.com/balance");
        config.response_mappings = vec![ResponseMapping {
            variable: "bal".to_string(),
            path: "data.balance".to_string(),
        }];
        let data = CallApiData {
            api_request: config,
        };

        let mut ctx = NodeContext {
            execution: &mut execution,
            transport: &transport,
            api: &api,
        };
        let outcome = call_api(&data, &mut ctx).await.unwrap();

        assert_eq!(outcome, NodeOutcome::Next(Handle::Main));
        assert!(!execution.variables.contains_key("bal"));
    }

    #[tokio::test]
    async fn test_non_2xx_fails_node() {
        let mut execution = test_execution();
        let transport = MockTransport::default();
        let api = MockApiClient::responding(503, json!({"error": "down"}));
        let data = CallApiData {
            api_request: request("https://api.example.com/balance"),
        };

        let mut ctx = NodeContext {
            execution: &mut execution,
            transport: &transport,
            api: &api,
        };
        let outcome = call_api(&data, &mut ctx).await.unwrap();

        match outcome {
            NodeOutcome::Fail(reason) => assert!(reason.contains("503")),
            other => panic!("Expected Fail, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_fails_node() {
        let mut execution = test_execution();
        let transport = MockTransport::default();
        let api =
            MockApiClient::erroring(EngineError::ExternalCall("connection refused".to_string()));
        let data = CallApiData {
            api_request: request("https://api.example.com/balance"),
        };

        let mut ctx = NodeContext {
            execution: &mut execution,
            transport: &transport,
            api: &api,
        };
        let outcome = call_api(&data, &mut ctx).await.unwrap();

        match outcome {
            NodeOutcome::Fail(reason) => assert!(reason.contains("connection refused")),
            other => panic!("Expected Fail, got {:?}", other),
        }
    }

    #[test]
    fn test_assemble_interpolates_everything() {
        let mut variables = HashMap::new();
        variables.insert("waId".to_string(), json!("15551234567"));
        variables.insert("token".to_string(), json!("s3cret"));

        let mut config = request("https://api.example.com/contacts/{{waId}}");
        config.method = HttpMethod::Post;
        config.params = vec![
            pair("source", "sabflow", true),
            pair("debug", "1", false), // disabled, must not be sent
        ];
        config.headers = vec![pair("X-Contact", "{{waId}}", true)];
        config.auth = ApiAuth::Bearer {
            token: "{{token}}".to_string(),
        };
        config.body = ApiBody::Json {
            json: "{\"contact\": \"{{waId}}\"}".to_string(),
        };

        let assembled = assemble(&config, &variables).unwrap();

        assert_eq!(assembled.url, "https://api.example.com/contacts/15551234567");
        assert_eq!(assembled.query, vec![("source".to_string(), "sabflow".to_string())]);
        assert_eq!(
            assembled.headers,
            vec![
                ("X-Contact".to_string(), "15551234567".to_string()),
                ("Authorization".to_string(), "Bearer s3cret".to_string()),
            ]
        );
        assert_eq!(
            assembled.body,
            Some(ApiCallBody::Json(json!({"contact": "15551234567"})))
        );
    }

    #[test]
    fn test_assemble_api_key_auth_placement() {
        let variables = HashMap::new();

        let mut config = request("https://api.example.com");
        config.auth = ApiAuth::ApiKey {
            key: "X-Api-Key".to_string(),
            value: "secret".to_string(),
            location: ApiKeyLocation::Header,
        };
        let assembled = assemble(&config, &variables).unwrap();
        assert_eq!(
            assembled.headers,
            vec![("X-Api-Key".to_string(), "secret".to_string())]
        );
        assert!(assembled.query.is_empty());

        config.auth = ApiAuth::ApiKey {
            key: "api_key".to_string(),
            value: "secret".to_string(),
            location: ApiKeyLocation::Query,
        };
        let assembled = assemble(&config, &variables).unwrap();
        assert_eq!(
            assembled.query,
            vec![("api_key".to_string(), "secret".to_string())]
        );
        assert!(assembled.headers.is_empty());
    }

    #[test]
    fn test_assemble_basic_auth_and_form_body() {
        let variables = HashMap::new();

        let mut config = request("https://api.example.com");
        config.auth = ApiAuth::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        config.body = ApiBody::FormData {
            form_data: vec![pair("field", "value", true), pair("off", "x", false)],
        };

        let assembled = assemble(&config, &variables).unwrap();
        assert_eq!(
            assembled.basic_auth,
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(
            assembled.body,
            Some(ApiCallBody::Form(vec![(
                "field".to_string(),
                "value".to_string()
            )]))
        );
    }

    #[tokio::test]
    async fn test_invalid_json_body_fails_node() {
        let mut execution = test_execution();
        let transport = MockTransport::default();
        let api = MockApiClient::responding(200, json!(null));

        let mut config = request("https://api.example.com");
        config.body = ApiBody::Json {
            json: "{not json".to_string(),
        };
        let data = CallApiData {
            api_request: config,
        };

        let mut ctx = NodeContext {
            execution: &mut execution,
            transport: &transport,
            api: &api,
        };
        let outcome = call_api(&data, &mut ctx).await.unwrap();

        match outcome {
            NodeOutcome::Fail(reason) => assert!(reason.contains("not valid JSON")),
            other => panic!("Expected Fail, got {:?}", other),
        }
        // The request never went out
        assert!(api.requests().is_empty());
    }
}
