use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::detector::StatusSource;
use super::gate::{RoleVerifier, VerifyResponse};
use super::{SyncError, SyncResult};
use crate::identity::{LoginRequest, RoleCheckResult};
use crate::inventory::{
    AssignRequest, LogFilter, LogView, NewWeapon, NewWeaponType, ReturnRequest, UserPatch, UserView, WeaponPatch, WeaponView,
};
use crate::model::{Collection, User, Weapon, WeaponType};
use crate::server::auth::SignInResponse;
use crate::server::verify::VerifyRequest;
use crate::server::CSRF_HEADER;
use crate::status::CollectionStatus;

#[derive(Debug, Clone, Default)]
struct Credentials {
    cookie_header: String,
    csrf: String,
    user: Option<User>,
}

/// HTTP session against the armory API. Cookies from `Set-Cookie` are kept
/// in a single `Cookie` header so they also work for plain-http hosts.
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    client: reqwest::Client,
    creds: Arc<RwLock<Credentials>>,
}

fn capture_cookies(headers: &HeaderMap) -> Vec<String> {
    let mut cookies = Vec::new();
    for val in headers.get_all(SET_COOKIE).iter() {
        if let Ok(s) = val.to_str() {
            // take name=value before first ';'
            let nv = s.split_once(';').map(|(nv, _)| nv).unwrap_or(s);
            cookies.push(nv.trim().to_string());
        }
    }
    cookies
}

async fn error_for(resp: reqwest::Response) -> SyncError {
    let status = resp.status().as_u16();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    let message = body
        .get("error")
        .or_else(|| body.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or("request failed")
        .to_string();
    SyncError::Status { status, message }
}

impl ApiClient {
    pub fn new(base: &str) -> SyncResult<Self> {
        let base = Url::parse(base).map_err(|e| SyncError::Config(format!("invalid base URL {}: {}", base, e)))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self { base, client, creds: Arc::new(RwLock::new(Credentials::default())) })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn current_user(&self) -> Option<User> {
        self.creds.read().user.clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.creds.read().user.is_some()
    }

    fn url(&self, path: &str) -> SyncResult<Url> {
        self.base.join(path).map_err(|e| SyncError::Config(e.to_string()))
    }

    fn auth_headers(&self) -> SyncResult<HeaderMap> {
        let creds = self.creds.read();
        let mut headers = HeaderMap::new();
        if !creds.cookie_header.is_empty() {
            headers.insert(COOKIE, HeaderValue::from_str(&creds.cookie_header).map_err(|e| SyncError::Config(e.to_string()))?);
        }
        if !creds.csrf.is_empty() {
            headers.insert(CSRF_HEADER, HeaderValue::from_str(&creds.csrf).map_err(|e| SyncError::Config(e.to_string()))?);
        }
        Ok(headers)
    }

    async fn raw<B: Serialize + ?Sized>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<reqwest::Response> {
        let mut req = self.client.request(method, self.url(path)?).headers(self.auth_headers()?);
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    async fn send<T: DeserializeOwned, B: Serialize + ?Sized>(&self, method: Method, path: &str, body: Option<&B>) -> SyncResult<T> {
        let resp = self.raw(method, path, body).await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        self.send::<T, ()>(Method::GET, path, None).await
    }

    /// Exchange a Discord access token for an armory session.
    pub async fn sign_in(&self, access_token: &str, expires_in: Option<u64>) -> SyncResult<User> {
        let req = LoginRequest { access_token: access_token.to_string(), expires_in };
        let resp = self.client.post(self.url("/api/auth/sign-in")?).json(&req).send().await?;
        if !resp.status().is_success() {
            return Err(error_for(resp).await);
        }
        let cookies = capture_cookies(resp.headers());
        let body: SignInResponse = resp.json().await?;
        let mut creds = self.creds.write();
        creds.cookie_header = cookies.join("; ");
        creds.csrf = body.csrf;
        creds.user = Some(body.user.clone());
        Ok(body.user)
    }

    pub async fn sign_out(&self) -> SyncResult<()> {
        let result = self.send::<serde_json::Value, ()>(Method::POST, "/api/auth/sign-out", None).await;
        *self.creds.write() = Credentials::default();
        result.map(|_| ())
    }

    pub async fn data_status(&self) -> SyncResult<CollectionStatus> {
        self.get("/api/data-status").await
    }

    /// Role check; 401/403 are answers here, not errors.
    pub async fn verify_role(&self, user_id: &str) -> SyncResult<VerifyResponse> {
        let body = VerifyRequest { user_id: Some(user_id.to_string()) };
        let resp = self.raw(Method::POST, "/api/verify-discord-role", Some(&body)).await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        let body = serde_json::from_slice::<RoleCheckResult>(&bytes).ok();
        Ok(VerifyResponse { status, body })
    }

    pub async fn list_weapons(&self) -> SyncResult<Vec<WeaponView>> {
        self.get("/api/weapons").await
    }

    pub async fn list_weapon_types(&self) -> SyncResult<Vec<WeaponType>> {
        self.get("/api/weapon-types").await
    }

    pub async fn list_users(&self) -> SyncResult<Vec<UserView>> {
        self.get("/api/users").await
    }

    pub async fn list_logs(&self, filter: &LogFilter) -> SyncResult<Vec<LogView>> {
        let mut url = self.url("/api/logs")?;
        {
            let mut q = url.query_pairs_mut();
            if let Some(w) = &filter.weapon_id {
                q.append_pair("weaponId", w);
            }
            if let Some(u) = &filter.user_id {
                q.append_pair("userId", u);
            }
            if let Some(l) = filter.limit {
                q.append_pair("limit", &l.to_string());
            }
        }
        let path = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        self.get(&path).await
    }

    /// Re-fetch one collection, returning its row count.
    pub async fn fetch_collection(&self, collection: Collection) -> SyncResult<usize> {
        Ok(match collection {
            Collection::Weapons => self.list_weapons().await?.len(),
            Collection::WeaponTypes => self.list_weapon_types().await?.len(),
            Collection::Users => self.list_users().await?.len(),
        })
    }

    pub async fn create_weapon(&self, input: &NewWeapon) -> SyncResult<Weapon> {
        self.send(Method::POST, "/api/weapons", Some(input)).await
    }

    pub async fn update_weapon(&self, id: &str, patch: &WeaponPatch) -> SyncResult<Weapon> {
        self.send(Method::PATCH, &format!("/api/weapons/{}", urlencoding::encode(id)), Some(patch)).await
    }

    pub async fn delete_weapon(&self, id: &str) -> SyncResult<()> {
        self.send::<serde_json::Value, ()>(Method::DELETE, &format!("/api/weapons/{}", urlencoding::encode(id)), None)
            .await
            .map(|_| ())
    }

    pub async fn assign_weapon(&self, req: &AssignRequest) -> SyncResult<Weapon> {
        self.send(Method::POST, "/api/weapons/assign", Some(req)).await
    }

    pub async fn return_weapon(&self, req: &ReturnRequest) -> SyncResult<Weapon> {
        self.send(Method::POST, "/api/weapons/return", Some(req)).await
    }

    pub async fn create_weapon_type(&self, input: &NewWeaponType) -> SyncResult<WeaponType> {
        self.send(Method::POST, "/api/weapon-types", Some(input)).await
    }

    pub async fn delete_weapon_type(&self, id: &str) -> SyncResult<()> {
        self.send::<serde_json::Value, ()>(Method::DELETE, &format!("/api/weapon-types/{}", urlencoding::encode(id)), None)
            .await
            .map(|_| ())
    }

    pub async fn update_user(&self, id: &str, patch: &UserPatch) -> SyncResult<User> {
        self.send(Method::PATCH, &format!("/api/users/{}", urlencoding::encode(id)), Some(patch)).await
    }

    pub async fn delete_user(&self, id: &str) -> SyncResult<()> {
        self.send::<serde_json::Value, ()>(Method::DELETE, &format!("/api/users/{}", urlencoding::encode(id)), None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn fetch_status(&self) -> SyncResult<CollectionStatus> {
        self.data_status().await
    }
}

#[async_trait]
impl RoleVerifier for ApiClient {
    async fn verify(&self, user_id: &str) -> SyncResult<VerifyResponse> {
        self.verify_role(user_id).await
    }
}
