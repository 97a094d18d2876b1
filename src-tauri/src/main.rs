#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bursary::auth::{change_admin_password, read_auth_record, setup_admin, verify_admin};
use bursary::export::export_file_name;
use bursary::mirror::{directory_mirror, MirrorWorker};
use bursary::record::StatusUpdate;
use bursary::store::ApplicationSummary;
use bursary::{
    AdminConsole, ApplicationDraft, ApplicationId, ApplicationPatch, ApplicationRecord,
    ApplicationStatus, BursaryConfig, ChangeEvent, FileStore, KeyValueStore, LedgerBalance,
    LedgerStatus, ReconcileWorker, RecordFilter, RecordOrigin, RecordStore, TransitionMetadata,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tauri::{AppHandle, Emitter, Manager, State};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CHANGE_EVENT: &str = "bursary://changed";

struct Session {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<RecordStore>,
    admin: Option<AdminConsole>,
    _reconcile: ReconcileWorker,
    _mirror: Option<MirrorWorker>,
}

struct AppState {
    data_dir: PathBuf,
    config: BursaryConfig,
    session: Mutex<Option<Session>>,
}

#[derive(Deserialize)]
struct SessionOpenRequest {
    password: Option<String>,
}

#[derive(Deserialize)]
struct AuthSetupRequest {
    password: String,
    iterations: Option<u32>,
}

#[derive(Deserialize)]
struct AdminLoginRequest {
    password: String,
    operator: String,
}

#[derive(Deserialize)]
struct AuthChangeRequest {
    current: String,
    next: String,
    iterations: Option<u32>,
}

#[derive(Deserialize)]
struct ApplicationIdRequest {
    id: String,
}

#[derive(Deserialize)]
struct ApplicationUpdateRequest {
    id: String,
    patch: ApplicationPatch,
}

#[derive(Deserialize)]
struct TransitionRequest {
    id: String,
    status: ApplicationStatus,
    #[serde(default)]
    awarded_amount: Option<u64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
struct AllocateRequest {
    amount: u64,
}

#[derive(Deserialize)]
struct PurgeOriginRequest {
    origin: RecordOrigin,
}

#[derive(Deserialize)]
struct ExportCsvRequest {
    filename: String,
    #[serde(default)]
    filter: RecordFilter,
}

#[derive(Serialize)]
struct SaveCsvResult {
    ok: bool,
    canceled: bool,
    filename: String,
    path: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct StorageInfoResult {
    ok: bool,
    path_label: String,
    encrypted: bool,
}

fn parse_id(raw: &str) -> Result<ApplicationId, String> {
    ApplicationId::parse(raw).map_err(|err| err.to_string())
}

fn with_session<T>(
    state: &AppState,
    run: impl FnOnce(&Session) -> Result<T, String>,
) -> Result<T, String> {
    let guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    let session = guard
        .as_ref()
        .ok_or_else(|| "Store is locked.".to_string())?;
    run(session)
}

fn with_admin<T>(
    state: &AppState,
    run: impl FnOnce(&AdminConsole) -> Result<T, String>,
) -> Result<T, String> {
    with_session(state, |session| {
        let admin = session
            .admin
            .as_ref()
            .ok_or_else(|| "Administrator login required.".to_string())?;
        run(admin)
    })
}

fn open_session(app: &AppHandle, state: &AppState, password: &str) -> Result<Session, String> {
    let config = &state.config;
    let kv: Arc<dyn KeyValueStore> = if config.encrypt_at_rest {
        if password.is_empty() {
            return Err("Password is required.".to_string());
        }
        Arc::new(FileStore::open_encrypted(state.data_dir.as_path(), password))
    } else {
        Arc::new(FileStore::open(state.data_dir.as_path()))
    };

    let mut store = RecordStore::open(Arc::clone(&kv), config.store_options())
        .map_err(|err| err.to_string())?;
    let mirror = config
        .mirror_path(state.data_dir.as_path())
        .map(|root| MirrorWorker::spawn(directory_mirror(root.as_path())));
    if let Some(mirror) = &mirror {
        store = store.with_mirror(mirror.handle());
    }

    let emitter = app.clone();
    store.subscribe(Arc::new(move |event: &ChangeEvent| {
        if let Err(err) = emitter.emit(CHANGE_EVENT, event.clone()) {
            warn!(%err, "failed to forward change event");
        }
    }));

    let store = Arc::new(store);
    let reconcile = ReconcileWorker::spawn(Arc::clone(&store), config.reconcile_interval());
    Ok(Session {
        kv,
        store,
        admin: None,
        _reconcile: reconcile,
        _mirror: mirror,
    })
}

#[tauri::command]
fn app_version(app: AppHandle) -> String {
    app.package_info().version.to_string()
}

#[tauri::command]
fn platform_name() -> String {
    std::env::consts::OS.to_string()
}

#[tauri::command]
fn storage_info(state: State<'_, AppState>) -> Result<StorageInfoResult, String> {
    Ok(StorageInfoResult {
        ok: true,
        path_label: state.data_dir.to_string_lossy().to_string(),
        encrypted: state.config.encrypt_at_rest,
    })
}

#[tauri::command]
fn setup_status(state: State<'_, AppState>) -> Result<serde_json::Value, String> {
    let guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    let Some(session) = guard.as_ref() else {
        return Ok(json!({
            "unlocked": false,
            "encrypted": state.config.encrypt_at_rest,
            "admin_configured": serde_json::Value::Null,
            "admin_signed_in": false,
        }));
    };
    let configured = read_auth_record(session.kv.as_ref())
        .map_err(|err| err.to_string())?
        .is_some();
    Ok(json!({
        "unlocked": true,
        "encrypted": state.config.encrypt_at_rest,
        "admin_configured": configured,
        "admin_signed_in": session.admin.is_some(),
    }))
}

#[tauri::command]
fn session_open(
    app: AppHandle,
    state: State<'_, AppState>,
    payload: SessionOpenRequest,
) -> Result<LedgerStatus, String> {
    let password = payload.password.unwrap_or_default();
    let session = open_session(&app, &state, password.as_str())?;
    let status = session.store.ledger_status().map_err(|err| err.to_string())?;
    let mut guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    *guard = Some(session);
    info!(data_dir = %state.data_dir.display(), "store unlocked");
    Ok(status)
}

#[tauri::command]
fn session_close(state: State<'_, AppState>) -> Result<bool, String> {
    let mut guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    Ok(guard.take().is_some())
}

#[tauri::command]
fn auth_setup(state: State<'_, AppState>, payload: AuthSetupRequest) -> Result<bool, String> {
    with_session(&state, |session| {
        setup_admin(
            session.kv.as_ref(),
            payload.password.as_str(),
            payload.iterations,
        )
        .map(|_| true)
        .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_login(state: State<'_, AppState>, payload: AdminLoginRequest) -> Result<bool, String> {
    let mut guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    let session = guard
        .as_mut()
        .ok_or_else(|| "Store is locked.".to_string())?;
    let operator = payload.operator.trim();
    if operator.is_empty() {
        return Err("Operator name is required.".to_string());
    }
    if !verify_admin(session.kv.as_ref(), payload.password.as_str())
        .map_err(|err| err.to_string())?
    {
        warn!(operator, "administrator login rejected");
        return Ok(false);
    }
    session.admin = Some(AdminConsole::new(Arc::clone(&session.store), operator));
    info!(operator, "administrator signed in");
    Ok(true)
}

#[tauri::command]
fn admin_logout(state: State<'_, AppState>) -> Result<bool, String> {
    let mut guard = state
        .session
        .lock()
        .map_err(|_| "Session lock poisoned.".to_string())?;
    Ok(guard
        .as_mut()
        .and_then(|session| session.admin.take())
        .is_some())
}

#[tauri::command]
fn auth_change(state: State<'_, AppState>, payload: AuthChangeRequest) -> Result<bool, String> {
    with_session(&state, |session| {
        change_admin_password(
            session.kv.as_ref(),
            payload.current.as_str(),
            payload.next.as_str(),
            payload.iterations,
        )
        .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn application_create(
    state: State<'_, AppState>,
    payload: ApplicationDraft,
) -> Result<ApplicationRecord, String> {
    with_session(&state, |session| {
        session.store.create(payload).map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn application_get(
    state: State<'_, AppState>,
    payload: ApplicationIdRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    with_session(&state, |session| {
        session.store.get(&id).map_err(|err| err.to_string())
    })
}

/// Applicant edit. A status carried in the patch always runs as the applicant.
#[tauri::command]
fn application_update(
    state: State<'_, AppState>,
    payload: ApplicationUpdateRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    let mut patch = payload.patch;
    patch.status = patch.status.map(|update| StatusUpdate {
        status: update.status,
        metadata: TransitionMetadata::applicant(),
    });
    with_session(&state, |session| {
        session.store.update(&id, patch).map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn application_submit(
    state: State<'_, AppState>,
    payload: ApplicationIdRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    with_session(&state, |session| {
        session
            .store
            .transition_status(
                &id,
                ApplicationStatus::PendingWardReview,
                TransitionMetadata::applicant(),
            )
            .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_list_records(
    state: State<'_, AppState>,
    payload: RecordFilter,
) -> Result<Vec<ApplicationRecord>, String> {
    with_admin(&state, |admin| {
        admin.list_records(payload).map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_update_record(
    state: State<'_, AppState>,
    payload: ApplicationUpdateRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    with_admin(&state, |admin| {
        admin
            .update_record(&id, payload.patch)
            .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_transition_status(
    state: State<'_, AppState>,
    payload: TransitionRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    with_admin(&state, |admin| {
        let mut metadata = TransitionMetadata::administrator(admin.operator());
        metadata.awarded_amount = payload.awarded_amount;
        metadata.reason = payload.reason;
        metadata.note = payload.note;
        admin
            .transition_status(&id, payload.status, metadata)
            .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_delete_record(
    state: State<'_, AppState>,
    payload: ApplicationIdRequest,
) -> Result<ApplicationRecord, String> {
    let id = parse_id(payload.id.as_str())?;
    with_admin(&state, |admin| {
        admin.delete_record(&id).map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_ledger_status(state: State<'_, AppState>) -> Result<LedgerStatus, String> {
    with_admin(&state, |admin| {
        admin.ledger_status().map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_allocate_budget(
    state: State<'_, AppState>,
    payload: AllocateRequest,
) -> Result<LedgerBalance, String> {
    with_admin(&state, |admin| {
        admin
            .allocate_budget(payload.amount)
            .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_summary(state: State<'_, AppState>) -> Result<ApplicationSummary, String> {
    with_admin(&state, |admin| admin.summary().map_err(|err| err.to_string()))
}

#[tauri::command]
fn admin_reconcile(state: State<'_, AppState>) -> Result<LedgerStatus, String> {
    with_admin(&state, |admin| {
        admin.reconcile().map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_purge_origin(
    state: State<'_, AppState>,
    payload: PurgeOriginRequest,
) -> Result<usize, String> {
    if payload.origin == RecordOrigin::Real {
        return Err("Real applications cannot be purged.".to_string());
    }
    with_admin(&state, |admin| {
        admin
            .purge_origin(payload.origin)
            .map_err(|err| err.to_string())
    })
}

#[tauri::command]
fn admin_export_csv(
    state: State<'_, AppState>,
    payload: ExportCsvRequest,
) -> Result<SaveCsvResult, String> {
    let csv = with_admin(&state, |admin| {
        admin
            .export_csv(payload.filter)
            .map_err(|err| err.to_string())
    })?;
    let default_name = export_file_name(payload.filename.as_str());
    let path = rfd::FileDialog::new()
        .add_filter("CSV", &["csv"])
        .set_file_name(default_name.as_str())
        .save_file();

    let Some(path) = path else {
        return Ok(SaveCsvResult {
            ok: false,
            canceled: true,
            filename: default_name,
            path: None,
            error: None,
        });
    };

    if let Err(err) = fs::write(&path, csv.as_bytes()) {
        return Ok(SaveCsvResult {
            ok: false,
            canceled: false,
            filename: default_name,
            path: Some(path.to_string_lossy().to_string()),
            error: Some(err.to_string()),
        });
    }
    Ok(SaveCsvResult {
        ok: true,
        canceled: false,
        filename: default_name,
        path: Some(path.to_string_lossy().to_string()),
        error: None,
    })
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        eprintln!("tracing subscriber already installed");
    }
}

fn resolve_app_state(app: &AppHandle) -> Result<AppState, Box<dyn std::error::Error>> {
    let base = app.path().app_data_dir()?;
    let data_dir = bursary::config::resolve_data_dir(base.join("Bursary").as_path());
    fs::create_dir_all(data_dir.as_path())?;
    let config = BursaryConfig::load(data_dir.as_path())?;
    Ok(AppState {
        data_dir,
        config,
        session: Mutex::new(None),
    })
}

fn main() {
    tauri::Builder::default()
        .setup(|app| {
            let state = resolve_app_state(app.handle())?;
            init_tracing(state.config.log_filter.as_str());
            info!(
                data_dir = %state.data_dir.display(),
                jurisdiction = state.config.jurisdiction.as_str(),
                encrypted = state.config.encrypt_at_rest,
                "bursary desktop starting"
            );
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            app_version,
            platform_name,
            storage_info,
            setup_status,
            session_open,
            session_close,
            auth_setup,
            admin_login,
            admin_logout,
            auth_change,
            application_create,
            application_get,
            application_update,
            application_submit,
            admin_list_records,
            admin_update_record,
            admin_transition_status,
            admin_delete_record,
            admin_ledger_status,
            admin_allocate_budget,
            admin_summary,
            admin_reconcile,
            admin_purge_origin,
            admin_export_csv
        ])
        .run(tauri::generate_context!())
        .expect("failed to run Bursary desktop");
}
