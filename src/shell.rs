use serde::Serialize;
use std::sync::Arc;
use tauri::{
    menu::{Menu, MenuItem, PredefinedMenuItem},
    tray::{MouseButton, MouseButtonState, TrayIconBuilder, TrayIconEvent},
    AppHandle, Emitter, Manager, State,
};
use time::OffsetDateTime;

use crate::config::DesktopConfig;
use crate::console::{ConsoleSubscriptions, LogConsole};
use crate::desktop::DesktopContext;
use crate::event_bridge::EventBridge;
use crate::host::{
    BroadcastEmitter, EventEmitter, HostEvent, ProcessHost, BACKEND_ERROR_EVENT,
    BACKEND_LOG_EVENT, BACKEND_TERMINATED_EVENT, SHOW_LOGS_EVENT,
};
use crate::log_buffer::{format_export_timestamp, LogEntry, LogKind};
use crate::sidecar::{BackendHost, BackendLaunch};
use crate::status::RunState;
use crate::supervisor::ProcessSupervisor;

const TRAY_ID: &str = "main";
const MAIN_WINDOW: &str = "main";

type ShellHost = Arc<BackendHost<TauriEmitter>>;

/// Forwards host events to the webview under their wire names and to the in-process
/// broadcast transport the log console listens on.
pub struct TauriEmitter {
    app: AppHandle,
    relay: BroadcastEmitter,
}

impl TauriEmitter {
    pub fn new(app: AppHandle, relay: BroadcastEmitter) -> Self {
        Self { app, relay }
    }
}

impl EventEmitter for TauriEmitter {
    fn emit(&self, event: HostEvent) -> Result<(), String> {
        if let Err(error) = self.relay.emit(event.clone()) {
            log::warn!("[shell] log console relay failed: {error}");
        }

        let result = match &event {
            HostEvent::Log(line) => self.app.emit(BACKEND_LOG_EVENT, line.clone()),
            HostEvent::Error(line) => self.app.emit(BACKEND_ERROR_EVENT, line.clone()),
            HostEvent::Terminated(info) => self.app.emit(BACKEND_TERMINATED_EVENT, info.clone()),
            HostEvent::ShowRequested => self.app.emit(SHOW_LOGS_EVENT, ()),
        };

        result.map_err(|error| format!("Failed to emit {}: {error}", event.kind().event_name()))
    }
}

pub struct DesktopShellState {
    host: ShellHost,
    console: Arc<LogConsole<ShellHost>>,
    _subscriptions: ConsoleSubscriptions,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryView {
    id: u64,
    timestamp: String,
    kind: LogKind,
    message: String,
}

impl From<&LogEntry> for LogEntryView {
    fn from(entry: &LogEntry) -> Self {
        Self {
            id: entry.id,
            timestamp: format_export_timestamp(entry.timestamp),
            kind: entry.kind,
            message: entry.message.clone(),
        }
    }
}

// Backend commands go through the console so the session log narrates them and the
// run state (and with it the tray) follows.
#[tauri::command]
async fn start_backend(state: State<'_, DesktopShellState>) -> Result<(), String> {
    state.console.start().await.map_err(|error| error.to_string())
}

#[tauri::command]
async fn stop_backend(state: State<'_, DesktopShellState>) -> Result<(), String> {
    state.console.stop().await.map_err(|error| error.to_string())
}

#[tauri::command]
async fn restart_backend(state: State<'_, DesktopShellState>) -> Result<(), String> {
    state.console.restart().await.map_err(|error| error.to_string())
}

#[tauri::command]
async fn get_backend_status(state: State<'_, DesktopShellState>) -> Result<bool, String> {
    state.host.get_backend_status().await
}

#[tauri::command]
fn get_logs(state: State<'_, DesktopShellState>) -> Vec<LogEntryView> {
    state.console.entries().iter().map(LogEntryView::from).collect()
}

#[tauri::command]
fn clear_logs(state: State<'_, DesktopShellState>) {
    state.console.clear();
}

#[tauri::command]
fn get_run_state(state: State<'_, DesktopShellState>) -> RunState {
    state.console.run_state()
}

/// Writes the export into the user's download directory and returns its path.
#[tauri::command]
fn export_logs(app: AppHandle, state: State<'_, DesktopShellState>) -> Result<String, String> {
    let directory = app
        .path()
        .download_dir()
        .map_err(|error| format!("Failed to resolve download directory: {error}"))?;
    let path = state
        .console
        .export_to(&directory, OffsetDateTime::now_utc().date())?;
    Ok(path.display().to_string())
}

fn create_tray(app: &AppHandle) -> tauri::Result<()> {
    let menu = build_tray_menu(app, false)?;

    let mut tray = TrayIconBuilder::with_id(TRAY_ID)
        .menu(&menu)
        .show_menu_on_left_click(false)
        .on_menu_event(|app, event| handle_tray_menu_event(app, event.id.as_ref()))
        .on_tray_icon_event(|tray, event| {
            if let TrayIconEvent::Click {
                button: MouseButton::Left,
                button_state: MouseButtonState::Up,
                ..
            } = event
            {
                show_main_window(tray.app_handle());
            }
        });
    if let Some(icon) = app.default_window_icon() {
        tray = tray.icon(icon.clone());
    }
    tray.build(app)?;

    Ok(())
}

fn build_tray_menu(app: &AppHandle, is_running: bool) -> tauri::Result<Menu<tauri::Wry>> {
    let status_text = if is_running {
        "Status: Running"
    } else {
        "Status: Stopped"
    };

    Menu::with_items(
        app,
        &[
            &MenuItem::with_id(app, "status", status_text, false, None::<&str>)?,
            &PredefinedMenuItem::separator(app)?,
            &MenuItem::with_id(app, "show", "Show Window", true, None::<&str>)?,
            &PredefinedMenuItem::separator(app)?,
            &MenuItem::with_id(app, "start", "Start Service", !is_running, None::<&str>)?,
            &MenuItem::with_id(app, "stop", "Stop Service", is_running, None::<&str>)?,
            &MenuItem::with_id(app, "restart", "Restart Service", is_running, None::<&str>)?,
            &PredefinedMenuItem::separator(app)?,
            &MenuItem::with_id(app, "logs", "View Logs", true, None::<&str>)?,
            &PredefinedMenuItem::separator(app)?,
            &MenuItem::with_id(app, "quit", "Quit", true, None::<&str>)?,
        ],
    )
}

fn update_tray_menu(app: &AppHandle, is_running: bool) {
    let Some(tray) = app.tray_by_id(TRAY_ID) else {
        return;
    };
    match build_tray_menu(app, is_running) {
        Ok(menu) => {
            if let Err(error) = tray.set_menu(Some(menu)) {
                log::warn!("[shell] failed to set tray menu: {error}");
            }
        }
        Err(error) => log::warn!("[shell] failed to build tray menu: {error}"),
    }
}

/// Keeps the tray menu in step with the console's run state.
fn spawn_tray_sync(app: AppHandle, console: &LogConsole<ShellHost>) {
    let mut watcher = console.status().watch();
    tokio::spawn(async move {
        while watcher.changed().await.is_ok() {
            let running = watcher.borrow_and_update().is_running();
            update_tray_menu(&app, running);
        }
    });
}

fn show_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.show();
        let _ = window.set_focus();
    }
}

fn handle_tray_menu_event(app: &AppHandle, event_id: &str) {
    match event_id {
        "show" => show_main_window(app),
        "start" | "stop" | "restart" => {
            let app_handle = app.clone();
            let action = event_id.to_string();
            tauri::async_runtime::spawn(async move {
                let Some(state) = app_handle.try_state::<DesktopShellState>() else {
                    return;
                };
                let console = state.console.clone();
                let result = match action.as_str() {
                    "start" => console.start().await,
                    "stop" => console.stop().await,
                    _ => console.restart().await,
                };
                if let Err(error) = result {
                    log::error!("[shell] failed to {action} backend: {error}");
                }
            });
        }
        "logs" => {
            if let Some(state) = app.try_state::<DesktopShellState>() {
                state.host.request_show_logs();
            }
        }
        "quit" => {
            let app_handle = app.clone();
            tauri::async_runtime::spawn(async move {
                if let Some(state) = app_handle.try_state::<DesktopShellState>() {
                    let _ = state.host.stop_backend().await;
                }
                app_handle.exit(0);
            });
        }
        _ => {}
    }
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let config = DesktopConfig::from_env();

    let result = tauri::Builder::default()
        .plugin(
            tauri_plugin_log::Builder::default()
                .level(log::LevelFilter::Info)
                .build(),
        )
        .invoke_handler(tauri::generate_handler![
            start_backend,
            stop_backend,
            restart_backend,
            get_backend_status,
            get_logs,
            clear_logs,
            get_run_state,
            export_logs
        ])
        .setup(move |app| {
            let handle = app.handle().clone();
            let relay = BroadcastEmitter::new();
            let context = DesktopContext::probe(&config);
            let bridge = EventBridge::new(context.clone(), Some(relay.sender()));

            let host: ShellHost = Arc::new(BackendHost::new(
                BackendLaunch::from(&config),
                TauriEmitter::new(handle.clone(), relay),
            ));
            let supervisor = Arc::new(ProcessSupervisor::new(context, host.clone()));
            let console = Arc::new(LogConsole::new(&config, supervisor, bridge.clone()));
            let subscriptions = console.attach();
            app.manage(DesktopShellState {
                host,
                console: console.clone(),
                _subscriptions: subscriptions,
            });

            create_tray(&handle)?;

            let poll_interval = config.status_poll_interval();
            let delay = config.auto_start_delay();
            tauri::async_runtime::spawn(async move {
                if let Err(error) = bridge.spawn_pump() {
                    log::warn!("[shell] log console will not receive backend events: {error}");
                }
                console.spawn_status_polling(poll_interval);
                spawn_tray_sync(handle.clone(), &console);

                tokio::time::sleep(delay).await;
                if let Err(error) = console.start().await {
                    log::error!("[shell] failed to auto-start backend: {error}");
                }
            });

            Ok(())
        })
        .on_window_event(|_window, _event| {
            #[cfg(target_os = "macos")]
            if let tauri::WindowEvent::CloseRequested { api, .. } = _event {
                let _ = _window.hide();
                api.prevent_close();
            }
        })
        .run(tauri::generate_context!());

    if let Err(error) = result {
        log::error!("[shell] error while running tauri application: {error}");
        eprintln!("error while running tauri application: {error}");
        std::process::exit(1);
    }
}
