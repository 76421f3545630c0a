use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use armory::client::gate::SIGN_IN_ROUTE;
use armory::client::{AccessGate, ApiClient, ChangeDetector, ChangeHandlers, GateState, Navigation, SyncError, TickOutcome};
use armory::config::AppConfig;
use armory::discord::{DiscordApi, DiscordUser, GuildMember, MemberLookup};
use armory::error::{AppError, AppResult};
use armory::inventory::{self, AssignRequest, LogFilter, NewWeapon, NewWeaponType, ReturnRequest, WeaponPatch};
use armory::model::{Collection, Millis, WeaponStatus};
use armory::push::{PushNotifier, PushTransport};
use armory::server::{router, AppState, CSRF_HEADER};
use armory::status::CollectionClock;
use armory::storage::SharedStore;
use armory::tprintln;

const GUILD: &str = "guild-1";
const ROLE: &str = "role-armory";

/// Discord stand-in keyed by access token.
#[derive(Default)]
struct FakeDiscord {
    users: HashMap<String, DiscordUser>,
    members: HashMap<String, MemberLookup>,
    broken: bool,
}

impl FakeDiscord {
    fn with(mut self, token: &str, id: &str, member: MemberLookup) -> Self {
        self.users.insert(
            token.to_string(),
            DiscordUser {
                id: id.to_string(),
                username: format!("{}-name", id),
                global_name: None,
                email: Some(format!("{}@example.com", id)),
                avatar: None,
            },
        );
        self.members.insert(token.to_string(), member);
        self
    }
}

fn member_with_role() -> MemberLookup {
    MemberLookup::Member(GuildMember { roles: vec![ROLE.to_string()], nick: Some("Quartermaster".into()) })
}

#[async_trait]
impl DiscordApi for FakeDiscord {
    async fn current_user(&self, access_token: &str) -> AppResult<Option<DiscordUser>> {
        Ok(self.users.get(access_token).cloned())
    }

    async fn guild_member(&self, access_token: &str, _guild_id: &str) -> AppResult<MemberLookup> {
        if self.broken {
            return Err(AppError::transport("discord_unreachable", "connection reset"));
        }
        Ok(self.members.get(access_token).cloned().unwrap_or(MemberLookup::TokenExpired))
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, String)>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, e)| e.clone()).collect()
    }
}

#[async_trait]
impl PushTransport for Recorder {
    async fn trigger(&self, channel: &str, event: &str, _payload: &serde_json::Value) -> AppResult<()> {
        self.sent.lock().push((channel.to_string(), event.to_string()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

struct BrokenClock;

impl CollectionClock for BrokenClock {
    fn latest_update(&self, _collection: Collection) -> AppResult<Option<Millis>> {
        Err(AppError::io("db_down", "connection refused"))
    }
}

struct TestApp {
    base: String,
    store: SharedStore,
    recorder: Arc<Recorder>,
}

fn gated_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.discord.guild_id = Some(GUILD.to_string());
    config.discord.required_role_id = Some(ROLE.to_string());
    config
}

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn start(config: AppConfig, discord: FakeDiscord) -> TestApp {
    let store = SharedStore::in_memory();
    let recorder = Arc::new(Recorder::default());
    let notifier = Arc::new(PushNotifier::with_transport(recorder.clone()));
    let state = AppState::new(config, store.clone(), Arc::new(discord), notifier);
    let base = serve(state).await;
    tprintln!("test server at {}", base);
    TestApp { base, store, recorder }
}

fn standard_discord() -> FakeDiscord {
    FakeDiscord::default()
        .with("admin-token", "d-admin", member_with_role())
        .with("member-token", "d-member", member_with_role())
        .with("outsider-token", "d-outsider", MemberLookup::NotMember)
        .with("roleless-token", "d-roleless", MemberLookup::Member(GuildMember::default()))
        .with("stale-token", "d-stale", MemberLookup::TokenExpired)
}

async fn signed_in(app: &TestApp, token: &str) -> ApiClient {
    let api = ApiClient::new(&app.base).unwrap();
    api.sign_in(token, Some(3600)).await.unwrap();
    api
}

async fn signed_in_admin(app: &TestApp) -> ApiClient {
    let api = signed_in(app, "admin-token").await;
    let id = api.current_user().unwrap().id;
    inventory::make_admin(&app.store, &id).unwrap();
    api
}

fn sessions_of(store: &SharedStore, user_id: &str) -> usize {
    store.read(|t| t.sessions.values().filter(|s| s.user_id == user_id).count())
}

#[tokio::test]
async fn sign_in_rejects_unknown_token() {
    let app = start(gated_config(), standard_discord()).await;
    let api = ApiClient::new(&app.base).unwrap();
    let err = api.sign_in("garbage", None).await.unwrap_err();
    assert!(matches!(err, SyncError::Status { status: 401, .. }));
    assert!(!api.is_signed_in());
}

#[tokio::test]
async fn inventory_lifecycle_over_http() {
    let app = start(gated_config(), standard_discord()).await;
    let admin = signed_in_admin(&app).await;
    let admin_id = admin.current_user().unwrap().id;

    let rifle = admin
        .create_weapon_type(&NewWeaponType { name: "Rifle".into(), ..Default::default() })
        .await
        .unwrap();
    let weapon = admin
        .create_weapon(&NewWeapon {
            serial_number: "SN-001".into(),
            name: "M4".into(),
            weapon_type_id: Some(rifle.id.clone()),
            ammunition: Some(30),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(weapon.status, WeaponStatus::Available);

    let dup = admin
        .create_weapon(&NewWeapon { serial_number: "SN-001".into(), name: "dup".into(), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(dup, SyncError::Status { status: 409, .. }));

    let assigned = admin
        .assign_weapon(&AssignRequest { weapon_id: weapon.id.clone(), user_id: Some(admin_id.clone()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(assigned.status, WeaponStatus::Assigned);
    assert_eq!(assigned.assigned_to_id.as_deref(), Some(admin_id.as_str()));

    let again = admin
        .assign_weapon(&AssignRequest { weapon_id: weapon.id.clone(), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(again, SyncError::Status { status: 409, .. }));

    let returned = admin
        .return_weapon(&ReturnRequest { weapon_id: weapon.id.clone(), ammunition: Some(12), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(returned.status, WeaponStatus::Available);
    assert_eq!(returned.ammunition, 12);

    let listed = admin.list_weapons().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].weapon_type.as_ref().map(|t| t.name.as_str()), Some("Rifle"));

    // The type is in use.
    let in_use = admin.delete_weapon_type(&rifle.id).await.unwrap_err();
    assert!(matches!(in_use, SyncError::Status { status: 400, .. }));

    admin.delete_weapon(&weapon.id).await.unwrap();
    let logs = admin
        .list_logs(&LogFilter { weapon_id: Some(weapon.id.clone()), ..Default::default() })
        .await
        .unwrap();
    // CREATED, ASSIGNED, RETURNED, DELETED survive the weapon.
    assert_eq!(logs.len(), 4);
    assert!(logs.iter().all(|l| l.weapon.is_none()));

    admin.delete_weapon_type(&rifle.id).await.unwrap();
    assert!(admin.list_weapon_types().await.unwrap().is_empty());

    let events = app.recorder.events();
    for expected in ["weapon-type-created", "weapon-created", "weapon-updated", "weapon-deleted", "weapon-type-deleted"] {
        assert!(events.iter().any(|e| e == expected), "missing {} in {:?}", expected, events);
    }
}

#[tokio::test]
async fn members_cannot_use_admin_routes() {
    let app = start(gated_config(), standard_discord()).await;
    let member = signed_in(&app, "member-token").await;
    let err = member
        .create_weapon_type(&NewWeaponType { name: "Pistol".into(), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Status { status: 403, .. }));
    assert!(member.list_weapons().await.unwrap().is_empty());
    assert!(matches!(member.list_users().await, Err(SyncError::Status { status: 403, .. })));
}

#[tokio::test]
async fn mutations_require_the_csrf_header() {
    let app = start(gated_config(), standard_discord()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/auth/sign-in", app.base))
        .json(&serde_json::json!({ "accessToken": "admin-token" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(';').next())
        .unwrap()
        .to_string();
    let body: serde_json::Value = resp.json().await.unwrap();
    let csrf = body["csrf"].as_str().unwrap().to_string();

    let client = reqwest::Client::new();
    let no_header = client
        .post(format!("{}/api/weapon-types", app.base))
        .header("cookie", &cookie)
        .json(&serde_json::json!({ "name": "Shotgun" }))
        .send()
        .await
        .unwrap();
    assert_eq!(no_header.status(), 403);
    let err: serde_json::Value = no_header.json().await.unwrap();
    assert_eq!(err["code"], "invalid_csrf");

    // Reads need only the cookie.
    let read = client.get(format!("{}/api/weapons", app.base)).header("cookie", &cookie).send().await.unwrap();
    assert_eq!(read.status(), 200);

    let anonymous = client.get(format!("{}/api/weapons", app.base)).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let with_header = client
        .post(format!("{}/api/auth/sign-out", app.base))
        .header("cookie", &cookie)
        .header(CSRF_HEADER, &csrf)
        .send()
        .await
        .unwrap();
    assert_eq!(with_header.status(), 200);
}

#[tokio::test]
async fn data_status_drives_the_detector() {
    let app = start(gated_config(), standard_discord()).await;
    let admin = signed_in_admin(&app).await;
    let before = admin.data_status().await.unwrap();

    let hits = Arc::new(Mutex::new(Vec::new()));
    let (w, t) = (hits.clone(), hits.clone());
    let handlers = ChangeHandlers::new()
        .on_weapons(move || w.lock().push(Collection::Weapons))
        .on_weapon_types(move || t.lock().push(Collection::WeaponTypes));
    let detector = ChangeDetector::new(Arc::new(admin.clone()), handlers);

    assert_eq!(detector.check().await, TickOutcome::Baseline);
    assert_eq!(detector.check().await, TickOutcome::Unchanged);

    admin
        .create_weapon(&NewWeapon { serial_number: "SN-9".into(), name: "Glock".into(), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(detector.check().await, TickOutcome::Changed(vec![Collection::Weapons]));
    assert_eq!(*hits.lock(), vec![Collection::Weapons]);

    let after = admin.data_status().await.unwrap();
    assert!(after.weapons > before.weapons);
    assert_eq!(after.weapon_types, before.weapon_types);
}

#[tokio::test]
async fn data_status_is_public_and_uncached() {
    let app = start(gated_config(), standard_discord()).await;
    let resp = reqwest::get(format!("{}/api/data-status", app.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers().get("cache-control").and_then(|v| v.to_str().ok()), Some("no-store"));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "weapons": 0, "weaponTypes": 0, "users": 0 }));
}

#[tokio::test]
async fn data_status_query_failure_is_500() {
    let store = SharedStore::in_memory();
    let state = AppState::new(gated_config(), store, Arc::new(standard_discord()), Arc::new(PushNotifier::disabled()))
        .with_clock(Arc::new(BrokenClock));
    let base = serve(state).await;
    let resp = reqwest::get(format!("{}/api/data-status", base)).await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "status_query_failed");
}

#[tokio::test]
async fn verified_member_passes_the_gate() {
    let app = start(gated_config(), standard_discord()).await;
    let member = signed_in(&app, "member-token").await;
    let user_id = member.current_user().unwrap().id;

    let gate = AccessGate::new(Arc::new(member.clone()));
    assert_eq!(gate.ensure_checked(Some(&user_id)).await, GateState::Verified);
    assert_eq!(gate.navigation(), Navigation::Stay);
    assert_eq!(sessions_of(&app.store, &user_id), 1);

    // The guild nickname is copied onto the user.
    let nick = app.store.read(|t| t.users.get(&user_id).and_then(|u| u.discord_nickname.clone()));
    assert_eq!(nick.as_deref(), Some("Quartermaster"));
}

#[tokio::test]
async fn denied_member_is_deprovisioned_and_sent_home() {
    let app = start(gated_config(), standard_discord()).await;
    let outsider = signed_in(&app, "outsider-token").await;
    let user_id = outsider.current_user().unwrap().id;

    let gate = AccessGate::new(Arc::new(outsider.clone()));
    let state = gate.ensure_checked(Some(&user_id)).await;
    assert!(matches!(state, GateState::Denied { .. }));
    assert!(matches!(gate.navigation(), Navigation::Home { .. }));
    assert_eq!(gate.navigation().route(), Some("/"));

    assert_eq!(sessions_of(&app.store, &user_id), 0);
    assert!(app.store.read(|t| !t.users.contains_key(&user_id)));
    assert!(app.store.read(|t| t.accounts.values().all(|a| a.user_id != user_id)));
    assert!(app.recorder.events().iter().any(|e| e == "user-deleted"));

    // The old cookie no longer works.
    assert!(matches!(outsider.list_weapons().await, Err(SyncError::Status { status: 401, .. })));
}

#[tokio::test]
async fn missing_role_without_deprovisioning_keeps_the_user() {
    let mut config = gated_config();
    config.deprovision_on_denied = false;
    let app = start(config, standard_discord()).await;
    let roleless = signed_in(&app, "roleless-token").await;
    let user_id = roleless.current_user().unwrap().id;

    let resp = roleless.verify_role(&user_id).await.unwrap();
    assert_eq!(resp.status, 403);
    let body = resp.body.unwrap();
    assert!(!body.has_role);
    assert!(body.message.is_some());
    assert_eq!(sessions_of(&app.store, &user_id), 0);
    assert!(app.store.read(|t| t.users.contains_key(&user_id)));
}

#[tokio::test]
async fn expired_token_only_drops_sessions() {
    let app = start(gated_config(), standard_discord()).await;
    let stale = signed_in(&app, "stale-token").await;
    let user_id = stale.current_user().unwrap().id;

    let resp = stale.verify_role(&user_id).await.unwrap();
    assert_eq!(resp.status, 401);
    let body = resp.body.clone().unwrap();
    assert!(body.token_expired && !body.has_role);

    assert_eq!(sessions_of(&app.store, &user_id), 0);
    assert!(app.store.read(|t| t.users.contains_key(&user_id)));
    assert!(app.store.read(|t| t.discord_account_for(&user_id).is_some()));

    // Signing in again and running the gate ends on the sign-in redirect.
    let again = signed_in(&app, "stale-token").await;
    let gate = AccessGate::new(Arc::new(again));
    assert!(matches!(gate.ensure_checked(Some(&user_id)).await, GateState::Expired { .. }));
    assert_eq!(gate.navigation(), Navigation::SignIn);
    assert_eq!(gate.navigation().route(), Some(SIGN_IN_ROUTE));
}

#[tokio::test]
async fn verify_guards_its_caller() {
    let app = start(gated_config(), standard_discord()).await;
    let member = signed_in(&app, "member-token").await;
    let other = signed_in(&app, "roleless-token").await;
    let other_id = other.current_user().unwrap().id;

    // Acting for someone else needs admin.
    let resp = member.verify_role(&other_id).await.unwrap();
    assert_eq!(resp.status, 401);
    assert_eq!(sessions_of(&app.store, &other_id), 1);

    let missing = reqwest::Client::new()
        .post(format!("{}/api/verify-discord-role", app.base))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);

    // An admin asking about a user without a Discord account.
    let admin = signed_in_admin(&app).await;
    let resp = admin.verify_role("no-such-user").await.unwrap();
    assert_eq!(resp.status, 404);
}

#[tokio::test]
async fn discord_outage_is_502_and_deletes_nothing() {
    let mut discord = standard_discord();
    discord.broken = true;
    let app = start(gated_config(), discord).await;
    let member = signed_in(&app, "member-token").await;
    let user_id = member.current_user().unwrap().id;

    let resp = member.verify_role(&user_id).await.unwrap();
    assert_eq!(resp.status, 502);
    assert_eq!(sessions_of(&app.store, &user_id), 1);

    let gate = AccessGate::new(Arc::new(member));
    assert_eq!(gate.ensure_checked(Some(&user_id)).await, GateState::Unverified);
}

#[tokio::test]
async fn unconfigured_role_gate_lets_everyone_in() {
    let app = start(AppConfig::default(), standard_discord()).await;
    let outsider = signed_in(&app, "outsider-token").await;
    let user_id = outsider.current_user().unwrap().id;
    let resp = outsider.verify_role(&user_id).await.unwrap();
    assert_eq!(resp.status, 200);
    assert!(resp.body.unwrap().has_role);
}

#[tokio::test]
async fn deleting_a_user_returns_their_weapons() {
    let app = start(gated_config(), standard_discord()).await;
    let admin = signed_in_admin(&app).await;
    let member = signed_in(&app, "member-token").await;
    let member_id = member.current_user().unwrap().id;

    let weapon = admin
        .create_weapon(&NewWeapon { serial_number: "SN-77".into(), name: "Carbine".into(), ..Default::default() })
        .await
        .unwrap();
    member
        .assign_weapon(&AssignRequest { weapon_id: weapon.id.clone(), ..Default::default() })
        .await
        .unwrap();
    let users = admin.list_users().await.unwrap();
    let held = users.iter().find(|u| u.user.id == member_id).map(|u| u.weapons.len());
    assert_eq!(held, Some(1));

    admin.delete_user(&member_id).await.unwrap();
    let weapons = admin.list_weapons().await.unwrap();
    assert_eq!(weapons[0].weapon.status, WeaponStatus::Available);
    assert!(weapons[0].assigned_to.is_none());

    let self_delete = admin.delete_user(&admin.current_user().unwrap().id).await.unwrap_err();
    assert!(matches!(self_delete, SyncError::Status { status: 400, .. }));

    let events = app.recorder.events();
    assert!(events.iter().any(|e| e == "user-deleted"));
    assert!(!events.iter().any(|e| e == "user-created"));

    // Admins move weapons in and out of maintenance with PATCH.
    let patched = admin
        .update_weapon(&weapon.id, &WeaponPatch { status: Some(WeaponStatus::Maintenance), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(patched.status, WeaponStatus::Maintenance);
}

#[tokio::test]
async fn push_disabled_still_commits_mutations() {
    let store = SharedStore::in_memory();
    let state = AppState::new(gated_config(), store.clone(), Arc::new(standard_discord()), Arc::new(PushNotifier::disabled()));
    let base = serve(state).await;
    let admin = ApiClient::new(&base).unwrap();
    admin.sign_in("admin-token", None).await.unwrap();
    inventory::make_admin(&store, &admin.current_user().unwrap().id).unwrap();
    admin
        .create_weapon_type(&NewWeaponType { name: "Launcher".into(), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(store.read(|t| t.weapon_types.len()), 1);
}
