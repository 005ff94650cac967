//! Scripted transport for tests and offline runs.
//!
//! Routes match on method and a URL fragment. Each route replays its scripted
//! replies in order; the final reply repeats once the script runs out. Every
//! request is recorded for later inspection.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value as JsonValue;

use super::error::ApiError;
use super::transport::{ApiRequest, ApiResponse, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubReply {
    Response(ApiResponse),
    Error(ApiError),
}

impl From<ApiResponse> for StubReply {
    fn from(response: ApiResponse) -> Self {
        StubReply::Response(response)
    }
}

impl From<ApiError> for StubReply {
    fn from(error: ApiError) -> Self {
        StubReply::Error(error)
    }
}

#[derive(Debug)]
struct Route {
    method: Method,
    fragment: String,
    replies: VecDeque<StubReply>,
}

#[derive(Debug, Default)]
pub struct StubTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script replies for requests whose URL contains `fragment`.
    ///
    /// Earlier routes win when several match, so register specific fragments first.
    pub fn on<I, R>(self, method: Method, fragment: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<StubReply>,
    {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                method,
                fragment: fragment.to_string(),
                replies: replies.into_iter().map(Into::into).collect(),
            });
        self
    }

    /// Shorthand for a route that always answers 200 with `body`.
    pub fn json(self, method: Method, fragment: &str, body: JsonValue) -> Self {
        self.on(method, fragment, [ApiResponse::json(200, &body)])
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded requests whose URL contains `fragment`.
    pub fn requests_to(&self, fragment: &str) -> Vec<ApiRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(fragment))
            .collect()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let reply = {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            routes
                .iter_mut()
                .find(|route| {
                    route.method == request.method
                        && request.url.contains(&route.fragment)
                        && !route.replies.is_empty()
                })
                .and_then(|route| {
                    if route.replies.len() > 1 {
                        route.replies.pop_front()
                    } else {
                        route.replies.front().cloned()
                    }
                })
        };

        match reply {
            Some(StubReply::Response(response)) => Ok(response),
            Some(StubReply::Error(error)) => Err(error),
            None => Ok(ApiResponse::new(
                404,
                format!("no stub for {} {}", request.method, request.url),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn replays_script_then_repeats_last_reply() {
        let stub = StubTransport::new().on(
            Method::GET,
            "/items",
            [ApiResponse::new(500, "down"), ApiResponse::json(200, &json!([]))],
        );
        let request = ApiRequest::get("https://api.test/items");

        assert_eq!(stub.send(&request).await.unwrap().status, 500);
        assert_eq!(stub.send(&request).await.unwrap().status, 200);
        assert_eq!(stub.send(&request).await.unwrap().status, 200);
        assert_eq!(stub.requests_to("/items").len(), 3);
    }

    #[tokio::test]
    async fn unmatched_requests_get_404() {
        let stub = StubTransport::new().json(Method::POST, "/search", json!({}));
        let response = stub
            .send(&ApiRequest::get("https://api.test/search"))
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }
}
