//! Shared test utilities for weka-reconcile integration tests.
//!
//! [`FakeWeka`] serves a small in-memory imitation of the Weka v2 REST API
//! over real HTTP, so tests exercise the reqwest transport end to end.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;

use weka_reconcile::{Driver, ProviderConfig, Session};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "admin-pw";
pub const ORG: &str = "Root";
pub const TOKEN: &str = "test-token";

/// A request as the fake received it. The path is relative to `/api/v2/`.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: Value,
}

#[derive(Default)]
struct Inner {
    token_type: String,
    requests: Vec<Recorded>,
    failures: HashMap<(String, String), (u16, Value)>,
    users: BTreeMap<String, Value>,
    kms: Option<Value>,
    filesystems: BTreeMap<String, Value>,
    groups: BTreeMap<String, Value>,
    buckets: BTreeMap<String, Value>,
    policies: BTreeMap<String, Value>,
    user_policies: BTreeMap<String, String>,
}

type Shared = Arc<Mutex<Inner>>;

/// Fake Weka API server bound to an ephemeral local port.
pub struct FakeWeka {
    pub addr: SocketAddr,
    inner: Shared,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl FakeWeka {
    pub async fn spawn() -> Self {
        let inner: Shared = Arc::new(Mutex::new(Inner {
            token_type: "Bearer".to_string(),
            ..Default::default()
        }));

        let router = Router::new().fallback(handle).with_state(inner.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("Server error");
        });

        Self {
            addr,
            inner,
            shutdown_tx,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/api/v2", self.addr)
    }

    pub fn config(&self) -> ProviderConfig {
        ProviderConfig::new(USERNAME, PASSWORD, ORG, self.endpoint())
    }

    /// Log in and build a driver over the real HTTP transport.
    pub async fn driver(&self) -> Driver {
        let config = self.config();
        let http = config.http_client().unwrap();
        let session = Session::login(&http, &config).await.unwrap();
        Driver::from_session(http, session)
    }

    pub fn set_token_type(&self, token_type: &str) {
        self.inner.lock().unwrap().token_type = token_type.to_string();
    }

    /// Answer `method path` with `status` and `body` until cleared.
    pub fn fail(&self, method: &str, path: &str, status: u16, body: Value) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert((method.to_string(), path.to_string()), (status, body));
    }

    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// `"METHOD path"` for every request, in order.
    pub fn request_log(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().unwrap().requests.clear();
    }

    pub fn user(&self, uid: &str) -> Option<Value> {
        self.inner.lock().unwrap().users.get(uid).cloned()
    }

    pub fn remove_user(&self, uid: &str) {
        self.inner.lock().unwrap().users.remove(uid);
    }

    pub fn filesystem(&self, uid: &str) -> Option<Value> {
        self.inner.lock().unwrap().filesystems.get(uid).cloned()
    }

    pub fn bucket(&self, name: &str) -> Option<Value> {
        self.inner.lock().unwrap().buckets.get(name).cloned()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().buckets.keys().cloned().collect()
    }

    pub fn attached_policy(&self, username: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .user_policies
            .get(username)
            .cloned()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

type Reply = (u16, Value);

fn ok(data: Value) -> Reply {
    (200, json!({ "data": data }))
}

fn missing(what: &str) -> Reply {
    (
        404,
        json!({"message": format!("{what} not found"), "data": {"error": "NotFound"}}),
    )
}

fn rejected(message: &str) -> Reply {
    (
        400,
        json!({"message": message, "data": {"error": "ValidationError", "reason": message}}),
    )
}

fn str_field<'a>(body: &'a Value, field: &str) -> &'a str {
    body[field].as_str().unwrap_or_default()
}

async fn handle(
    State(inner): State<Shared>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri
        .path()
        .strip_prefix("/api/v2/")
        .unwrap_or(uri.path())
        .to_string();
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    let (status, reply) = {
        let mut inner = inner.lock().unwrap();
        inner.requests.push(Recorded {
            method: method.to_string(),
            path: path.clone(),
            body: body.clone(),
        });

        let expected = format!("Bearer {TOKEN}");
        let authorized =
            headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some(expected.as_str());

        if let Some(failure) = inner
            .failures
            .get(&(method.to_string(), path.clone()))
            .cloned()
        {
            failure
        } else if path == "login" {
            inner.login(&body)
        } else if !authorized {
            (401, json!({"message": "Unauthorized"}))
        } else {
            let segments: Vec<&str> = path.split('/').collect();
            inner.route(method.as_str(), &segments, body)
        }
    };

    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        axum::Json(reply),
    )
        .into_response()
}

impl Inner {
    fn login(&self, body: &Value) -> Reply {
        if str_field(body, "username") != USERNAME
            || str_field(body, "password") != PASSWORD
            || str_field(body, "org") != ORG
        {
            return (401, json!({"message": "invalid username or password"}));
        }
        ok(json!({
            "access_token": TOKEN,
            "token_type": self.token_type,
            "expires_in": 300,
        }))
    }

    fn route(&mut self, method: &str, segments: &[&str], body: Value) -> Reply {
        match (method, segments) {
            ("POST", ["users"]) => self.create_user(body),
            ("GET", ["users"]) => ok(Value::Array(self.users.values().map(public_user).collect())),
            ("PUT", ["users", "password"]) => self.change_password(&body),
            ("PUT", ["users", uid]) => self.update_user(uid, &body),
            ("DELETE", ["users", uid]) => match self.users.remove(*uid) {
                Some(_) => ok(Value::Null),
                None => missing("user"),
            },

            ("POST", ["kms"]) => {
                self.kms = Some(body);
                ok(Value::Null)
            }
            ("GET", ["kms"]) => ok(self.kms.as_ref().map(kms_record).unwrap_or(Value::Null)),
            ("DELETE", ["kms"]) => {
                self.kms = None;
                ok(Value::Null)
            }

            ("POST", ["fileSystems"]) => self.create_filesystem(&body),
            ("GET", ["fileSystems", uid]) => match self.filesystems.get(*uid) {
                Some(fs) => ok(fs.clone()),
                None => missing("filesystem"),
            },
            ("PUT", ["fileSystems", uid]) => self.update_filesystem(uid, &body),
            ("DELETE", ["fileSystems", uid]) => match self.filesystems.remove(*uid) {
                Some(_) => ok(Value::Null),
                None => missing("filesystem"),
            },

            ("POST", ["fileSystemsGroups"]) => {
                let uid = uuid::Uuid::new_v4().to_string();
                let group = json!({
                    "uid": uid,
                    "name": body["name"],
                    "target_ssd_retention": body["target_ssd_retention"],
                    "start_demote": body["start_demote"],
                });
                self.groups.insert(uid, group.clone());
                ok(group)
            }
            ("GET", ["fileSystemsGroups", uid]) => match self.groups.get(*uid) {
                Some(group) => ok(group.clone()),
                None => missing("filesystem group"),
            },
            ("PUT", ["fileSystemsGroups", uid]) => match self.groups.get_mut(*uid) {
                Some(group) => {
                    for (wire, field) in [
                        ("new_name", "name"),
                        ("target_ssd_retention", "target_ssd_retention"),
                        ("start_demote", "start_demote"),
                    ] {
                        if let Some(value) = body.get(wire) {
                            group[field] = value.clone();
                        }
                    }
                    ok(group.clone())
                }
                None => missing("filesystem group"),
            },
            ("DELETE", ["fileSystemsGroups", uid]) => match self.groups.remove(*uid) {
                Some(_) => ok(Value::Null),
                None => missing("filesystem group"),
            },

            ("POST", ["s3", "buckets"]) => self.create_bucket(&body),
            ("GET", ["s3", "buckets"]) => ok(json!({
                "buckets": self.buckets.values().cloned().collect::<Vec<_>>()
            })),
            ("PUT", ["s3", "buckets", name, "quota"]) => match self.buckets.get_mut(*name) {
                Some(bucket) => {
                    bucket["hard_quota"] = body["hard_quota"].clone();
                    ok(Value::Null)
                }
                None => missing("bucket"),
            },
            ("PUT", ["s3", "buckets", name, "policy"]) => match self.buckets.get_mut(*name) {
                Some(bucket) => {
                    bucket["policy"] = body["bucket_policy"].clone();
                    ok(Value::Null)
                }
                None => missing("bucket"),
            },
            ("DELETE", ["s3", "buckets", name]) => match self.buckets.remove(*name) {
                Some(_) => ok(Value::Null),
                None => missing("bucket"),
            },

            ("POST", ["s3", "policies", "attach"]) => {
                let user = str_field(&body, "user_name").to_string();
                let policy = str_field(&body, "policy_name").to_string();
                if !self.policies.contains_key(&policy) {
                    return missing("policy");
                }
                self.user_policies.insert(user, policy);
                ok(Value::Null)
            }
            ("POST", ["s3", "policies", "detach"]) => {
                self.user_policies.remove(str_field(&body, "user_name"));
                ok(Value::Null)
            }
            ("POST", ["s3", "policies"]) => {
                let name = str_field(&body, "policy_name").to_string();
                self.policies
                    .insert(name, body["policy_file_content"].clone());
                ok(Value::Null)
            }
            ("GET", ["s3", "policies", name]) => match self.policies.get(*name) {
                Some(content) => ok(json!({"policy": {"name": name, "content": content}})),
                None => missing("policy"),
            },
            ("DELETE", ["s3", "policies", name]) => match self.policies.remove(*name) {
                Some(_) => ok(Value::Null),
                None => missing("policy"),
            },
            ("GET", ["s3", "userPolicies"]) => ok(json!({"users": self.user_policies})),

            _ => (
                404,
                json!({"message": format!("no route for {method} {}", segments.join("/"))}),
            ),
        }
    }

    fn create_user(&mut self, body: Value) -> Reply {
        let username = str_field(&body, "username");
        if self.users.values().any(|u| u["username"] == username) {
            return rejected("user already exists");
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let mut user = json!({
            "uid": uid,
            "username": username,
            "password": body["password"],
            "role": body["role"],
            "org_id": 0,
            "source": "Internal",
        });
        for field in ["posix_uid", "posix_gid"] {
            if let Some(value) = body.get(field) {
                user[field] = value.clone();
            }
        }
        self.users.insert(uid, user.clone());
        ok(public_user(&user))
    }

    fn change_password(&mut self, body: &Value) -> Reply {
        let username = str_field(body, "username");
        let Some(user) = self
            .users
            .values_mut()
            .find(|u| u["username"] == username)
        else {
            return missing("user");
        };
        if user["password"] != body["old_password"] {
            return rejected("old password is incorrect");
        }
        user["password"] = body["new_password"].clone();
        ok(Value::Null)
    }

    fn update_user(&mut self, uid: &str, body: &Value) -> Reply {
        let Some(user) = self.users.get_mut(uid) else {
            return missing("user");
        };
        if let Some(role) = body.get("role") {
            if role == "ClusterAdmin" {
                return rejected("role change refused");
            }
            user["role"] = role.clone();
        }
        for field in ["posix_uid", "posix_gid"] {
            if let Some(value) = body.get(field) {
                user[field] = value.clone();
            }
        }
        ok(public_user(user))
    }

    fn create_filesystem(&mut self, body: &Value) -> Reply {
        let uid = uuid::Uuid::new_v4().to_string();
        let total = body["total_capacity"].as_i64().unwrap_or_default();
        let ssd = body["ssd_capacity"].as_i64().unwrap_or(total);
        let obs: Vec<Value> = body
            .get("obs_name")
            .map(|name| vec![json!({"name": name})])
            .unwrap_or_default();

        let fs = json!({
            "uid": uid,
            "id": "FSId<1>",
            "name": body["name"],
            "group_name": body["group_name"],
            "group_id": "FSGroupId<0>",
            "status": "READY",
            "is_encrypted": body["encrypted"],
            "auth_required": body["auth_required"],
            "used_total": 0,
            "available_total": total,
            "used_ssd": 0,
            "available_ssd": ssd,
            "obs_buckets": obs,
        });
        self.filesystems.insert(uid, fs.clone());
        ok(fs)
    }

    fn update_filesystem(&mut self, uid: &str, body: &Value) -> Reply {
        let Some(fs) = self.filesystems.get_mut(uid) else {
            return missing("filesystem");
        };
        if let Some(name) = body.get("new_name") {
            fs["name"] = name.clone();
        }
        if let Some(total) = body.get("total_capacity") {
            fs["available_total"] = total.clone();
        }
        if let Some(ssd) = body.get("ssd_capacity") {
            fs["available_ssd"] = ssd.clone();
        }
        if let Some(auth) = body.get("auth_required") {
            fs["auth_required"] = auth.clone();
        }
        ok(fs.clone())
    }

    fn create_bucket(&mut self, body: &Value) -> Reply {
        let name = str_field(body, "bucket_name").to_string();
        if self.buckets.contains_key(&name) {
            return rejected("bucket already exists");
        }
        let path = body
            .get("existing_path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("/{name}"));
        self.buckets.insert(
            name.clone(),
            json!({
                "name": name,
                "path": path,
                "fs_uid": body["fs_uid"],
                "policy": body["policy"],
                "hard_quota": body.get("hard_quota").cloned().unwrap_or(Value::Null),
            }),
        );
        ok(Value::Null)
    }
}

fn public_user(user: &Value) -> Value {
    let mut public: Map<String, Value> = user.as_object().cloned().unwrap_or_default();
    public.remove("password");
    Value::Object(public)
}

fn kms_record(config: &Value) -> Value {
    if config.get("base_url").is_some() {
        json!({
            "kms_type": "HashiCorpVault",
            "params": {
                "base_url": config["base_url"],
                "master_key_name": config["master_key_name"],
            }
        })
    } else {
        json!({"kms_type": "KMIP", "params": {}})
    }
}
