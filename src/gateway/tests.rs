#[cfg(test)]
mod tests {
    use crate::config::BackendConfig;
    use crate::error::Error;
    use crate::gateway::{fetch_typed, BackendGateway, Collection, CollectionQuery, Gateway, RestClient};
    use crate::models::Incident;
    use crate::realtime::{ChangeEvent, ChangeFeed, LocalChangeFeed};
    use axum::{
        extract::{Query, State},
        http::{header::CONTENT_RANGE, HeaderMap, HeaderValue, Method, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: Method,
        query: HashMap<String, String>,
        apikey: Option<String>,
        authorization: Option<String>,
        prefer: Option<String>,
        body: Option<Value>,
    }

    #[derive(Clone)]
    struct FakeBackend {
        requests: Arc<Mutex<Vec<Recorded>>>,
        patch_status: Arc<Mutex<StatusCode>>,
        patch_range: Arc<Mutex<Option<String>>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                patch_status: Arc::new(Mutex::new(StatusCode::NO_CONTENT)),
                patch_range: Arc::new(Mutex::new(Some("*/1".to_string()))),
            }
        }

        fn record(&self, method: Method, query: HashMap<String, String>, headers: &HeaderMap, body: Option<Value>) {
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            self.requests.lock().unwrap().push(Recorded {
                method,
                query,
                apikey: header("apikey"),
                authorization: header("authorization"),
                prefer: header("prefer"),
                body,
            });
        }

        fn last(&self) -> Recorded {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn incident_rows() -> Value {
        json!([
            {
                "id": "a",
                "camera_id": "cam-1",
                "type": "Unauthorised Access",
                "thumbnail_url": "/thumbs/a.jpg",
                "ts_start": "2025-07-22T10:05:00+00:00",
                "ts_end": "2025-07-22T10:06:00+00:00",
                "resolved": false,
                "created_at": "2025-07-22T10:07:00+00:00",
                "camera": {
                    "id": "cam-1",
                    "name": "Vault",
                    "location": "Basement",
                    "is_active": true,
                    "created_at": "2025-07-01T00:00:00+00:00"
                }
            },
            {
                "id": "b",
                "camera_id": null,
                "type": "Face Recognised",
                "thumbnail_url": "/thumbs/b.jpg",
                "ts_start": "2025-07-22T09:00:00+00:00",
                "ts_end": "2025-07-22T09:01:00+00:00",
                "resolved": false,
                "created_at": "2025-07-22T09:02:00+00:00"
            }
        ])
    }

    async fn list_incidents(
        State(backend): State<FakeBackend>,
        method: Method,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        backend.record(method, query, &headers, None);
        ([(CONTENT_RANGE, "0-1/2")], Json(incident_rows())).into_response()
    }

    async fn patch_incident(
        State(backend): State<FakeBackend>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        backend.record(Method::PATCH, query, &headers, Some(body));
        let status = *backend.patch_status.lock().unwrap();
        let mut response = status.into_response();
        if let Some(range) = backend.patch_range.lock().unwrap().clone() {
            response
                .headers_mut()
                .insert(CONTENT_RANGE, HeaderValue::from_str(&range).unwrap());
        }
        response
    }

    async fn list_cameras() -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"code": "PGRST301", "message": "JWT expired"})),
        )
            .into_response()
    }

    async fn list_users() -> Response {
        (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response()
    }

    async fn serve(backend: FakeBackend) -> String {
        let app = Router::new()
            .route("/rest/v1/incidents", get(list_incidents).patch(patch_incident))
            .route("/rest/v1/cameras", get(list_cameras))
            .route("/rest/v1/users", get(list_users))
            .with_state(backend);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(app.into_make_service())
                .await
                .unwrap();
        });

        format!("http://{}", addr)
    }

    fn client(url: String) -> RestClient {
        RestClient::new(&BackendConfig {
            url,
            api_key: "anon-key".to_string(),
            access_token: Some("user-token".to_string()),
            ..BackendConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_select_sends_credentials_and_query() {
        let backend = FakeBackend::new();
        let rest = client(serve(backend.clone()).await);

        let query = CollectionQuery::new(Collection::Incidents)
            .select("*")
            .embed("camera", Collection::Cameras)
            .eq("resolved", false)
            .order_desc("ts_start");
        let gateway = BackendGateway::new(rest, Arc::new(LocalChangeFeed::new()));
        let incidents: Vec<Incident> = fetch_typed(&gateway, &query).await.unwrap();

        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].camera.as_ref().unwrap().name, "Vault");
        assert!(incidents[1].camera.is_none());

        let request = backend.last();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.apikey.as_deref(), Some("anon-key"));
        assert_eq!(request.authorization.as_deref(), Some("Bearer user-token"));
        assert_eq!(request.query["select"], "*,camera:cameras(*)");
        assert_eq!(request.query["resolved"], "eq.false");
        assert_eq!(request.query["order"], "ts_start.desc");
    }

    #[tokio::test]
    async fn test_count_reads_content_range() {
        let backend = FakeBackend::new();
        let rest = client(serve(backend.clone()).await);

        let query = CollectionQuery::new(Collection::Incidents)
            .select("id")
            .eq("resolved", true);
        assert_eq!(rest.count(&query).await.unwrap(), 2);

        let request = backend.last();
        assert_eq!(request.method, Method::HEAD);
        assert_eq!(request.prefer.as_deref(), Some("count=exact"));
        assert_eq!(request.query["resolved"], "eq.true");
    }

    #[tokio::test]
    async fn test_patch_sends_canonical_body() {
        let backend = FakeBackend::new();
        let rest = client(serve(backend.clone()).await);

        rest.patch(Collection::Incidents, "a", &json!({"resolved": true}))
            .await
            .unwrap();

        let request = backend.last();
        assert_eq!(request.method, Method::PATCH);
        assert_eq!(request.query["id"], "eq.a");
        assert_eq!(request.prefer.as_deref(), Some("return=minimal,count=exact"));
        assert_eq!(request.body, Some(json!({"resolved": true})));
    }

    #[tokio::test]
    async fn test_committed_patch_is_announced() {
        let backend = FakeBackend::new();
        let rest = client(serve(backend.clone()).await);
        let feed = Arc::new(LocalChangeFeed::new());
        let heard = Arc::new(Mutex::new(Vec::new()));
        {
            let heard = heard.clone();
            feed.subscribe(
                Collection::Incidents,
                Arc::new(move |event: ChangeEvent| {
                    heard.lock().unwrap().push(event);
                    Ok(())
                }),
            )
            .await
            .unwrap();
        }
        let gateway = BackendGateway::new(rest, feed);

        gateway
            .patch_entity(Collection::Incidents, "a", json!({"resolved": true}))
            .await
            .unwrap();
        *backend.patch_range.lock().unwrap() = Some("*/0".to_string());
        assert!(gateway
            .patch_entity(Collection::Incidents, "missing", json!({"resolved": true}))
            .await
            .is_err());

        // Only the committed write is announced
        let heard = heard.lock().unwrap();
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].routing_key(), "incidents.update");
        assert_eq!(heard[0].record, json!({"id": "a", "resolved": true}));
    }

    #[tokio::test]
    async fn test_patch_matching_no_row_is_rejected() {
        let backend = FakeBackend::new();
        *backend.patch_range.lock().unwrap() = Some("*/0".to_string());
        let rest = client(serve(backend.clone()).await);

        let err = rest
            .patch(Collection::Incidents, "missing", &json!({"resolved": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_patch_server_error_is_transport() {
        let backend = FakeBackend::new();
        *backend.patch_status.lock().unwrap() = StatusCode::INTERNAL_SERVER_ERROR;
        let rest = client(serve(backend.clone()).await);

        let err = rest
            .patch(Collection::Incidents, "a", &json!({"resolved": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_error_classification_over_http() {
        let backend = FakeBackend::new();
        let rest = client(serve(backend).await);

        let err = rest
            .select(&CollectionQuery::new(Collection::Cameras))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::Rejected {
                status: 401,
                message: "JWT expired".to_string()
            }
        );

        let err = rest
            .select(&CollectionQuery::new(Collection::Users).limit(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let rest = client(format!("http://{}", addr));
        let err = rest
            .select(&CollectionQuery::new(Collection::Incidents))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
