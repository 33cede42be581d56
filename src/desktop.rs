//! Tauri binding: the main webview window, the app menu and the exit hook.

use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use tauri::menu::{Menu, MenuEvent, MenuItem, PredefinedMenuItem, Submenu};
use tauri::webview::{NewWindowResponse, PageLoadEvent};
use tauri::window::Color;
use tauri::{AppHandle, Manager, Runtime, State, Url, WebviewUrl, WebviewWindow, WebviewWindowBuilder};
use tokio::sync::{oneshot, watch};

use crate::config::ShellConfig;
use crate::error::SurfaceError;
use crate::events::{EventBus, SurfaceEvent, SHELL_SOURCE};
use crate::shutdown::ShutdownReport;
use crate::supervisor::ShellStatus;
use crate::surface::{
    Navigation, NavigationPolicy, Surface, BACKGROUND_RGBA, INITIAL_HEIGHT, INITIAL_WIDTH,
};

pub const MAIN_WINDOW: &str = "main";
const WINDOW_TITLE: &str = "GameMotion";
const CONSOLE_RELAY_SCRIPT: &str = include_str!("console_relay.js");
/// Upper bound on how long exit waits for the supervisor's shutdown.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

const MENU_RELOAD: &str = "view.reload";
const MENU_FORCE_RELOAD: &str = "view.force_reload";
const MENU_TOGGLE_DEVTOOLS: &str = "view.toggle_devtools";

/// [`Surface`] over a Tauri webview window.
pub struct TauriSurface<R: Runtime> {
    window: WebviewWindow<R>,
}

impl<R: Runtime> TauriSurface<R> {
    pub fn new(window: WebviewWindow<R>) -> Self {
        Self { window }
    }
}

impl<R: Runtime> Surface for TauriSurface<R> {
    fn navigate(&self, url: &str) -> Result<(), SurfaceError> {
        let parsed = Url::parse(url).map_err(|err| SurfaceError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        self.window
            .navigate(parsed)
            .map_err(|err| SurfaceError::Load(err.to_string()))
    }

    fn show(&self) -> Result<(), SurfaceError> {
        self.window
            .show()
            .map_err(|err| SurfaceError::Window(err.to_string()))
    }

    fn open_devtools(&self) {
        #[cfg(debug_assertions)]
        self.window.open_devtools();
    }
}

/// State shared with Tauri commands and the exit hook.
pub struct DesktopState {
    pub bus: EventBus,
    pub status: watch::Receiver<ShellStatus>,
    pub exit: Mutex<Option<oneshot::Sender<()>>>,
    pub done: Mutex<Option<mpsc::Receiver<ShutdownReport>>>,
}

/// Creates the main window hidden, on a blank page, with page-load and
/// navigation hooks wired to the event bus.
pub fn build_main_window<R: Runtime>(
    app: &AppHandle<R>,
    config: &ShellConfig,
    bus: EventBus,
) -> Result<WebviewWindow<R>, SurfaceError> {
    let policy = NavigationPolicy::new(&config.frontend_url())?;
    let blank = Url::parse("about:blank").map_err(|err| SurfaceError::InvalidUrl {
        url: "about:blank".into(),
        reason: err.to_string(),
    })?;
    let (r, g, b, a) = BACKGROUND_RGBA;
    let load_policy = policy.clone();
    let window_policy = policy.clone();

    WebviewWindowBuilder::new(app, MAIN_WINDOW, WebviewUrl::External(blank))
        .title(WINDOW_TITLE)
        .inner_size(INITIAL_WIDTH, INITIAL_HEIGHT)
        .visible(false)
        .background_color(Color(r, g, b, a))
        .initialization_script(CONSOLE_RELAY_SCRIPT)
        .on_navigation(move |url| match policy.decide(url) {
            Navigation::Allow => true,
            Navigation::OpenExternally => {
                open_externally(url);
                false
            }
            Navigation::Deny => false,
        })
        .on_new_window(move |url, _features| {
            match window_policy.on_new_window(&url) {
                Navigation::OpenExternally => open_externally(&url),
                Navigation::Allow | Navigation::Deny => {
                    log::debug!(target: SHELL_SOURCE, "ignoring new window request for {url}")
                }
            }
            NewWindowResponse::Deny
        })
        .on_page_load(move |_window, payload| {
            let url = payload.url();
            match payload.event() {
                PageLoadEvent::Started => bus.surface(SurfaceEvent::LoadStarted {
                    url: url.to_string(),
                }),
                PageLoadEvent::Finished if load_policy.is_content(url) => {
                    bus.surface(SurfaceEvent::LoadSucceeded {
                        url: url.to_string(),
                    })
                }
                PageLoadEvent::Finished => {}
            }
        })
        .build()
        .map_err(|err| SurfaceError::Window(err.to_string()))
}

fn open_externally(url: &Url) {
    log::info!(target: SHELL_SOURCE, "opening {url} in the system browser");
    if let Err(err) = open::that(url.as_str()) {
        log::warn!(target: SHELL_SOURCE, "failed to open {url}: {err}");
    }
}

pub fn build_menu<R: Runtime>(app: &AppHandle<R>) -> tauri::Result<Menu<R>> {
    let reload = MenuItem::with_id(app, MENU_RELOAD, "Reload", true, Some("CmdOrCtrl+R"))?;
    let force_reload = MenuItem::with_id(
        app,
        MENU_FORCE_RELOAD,
        "Force Reload",
        true,
        Some("CmdOrCtrl+Shift+R"),
    )?;
    let separator = PredefinedMenuItem::separator(app)?;
    let devtools = MenuItem::with_id(
        app,
        MENU_TOGGLE_DEVTOOLS,
        "Toggle DevTools (F12)",
        true,
        Some("F12"),
    )?;
    let view = Submenu::with_items(
        app,
        "View",
        true,
        &[&reload, &force_reload, &separator, &devtools],
    )?;
    Menu::with_items(app, &[&view])
}

pub fn handle_menu_event<R: Runtime>(app: &AppHandle<R>, event: MenuEvent) {
    let Some(window) = app.get_webview_window(MAIN_WINDOW) else {
        return;
    };
    let result = match event.id().0.as_str() {
        MENU_RELOAD => window.eval("window.location.reload()"),
        MENU_FORCE_RELOAD => window.url().and_then(|url| window.navigate(url)),
        MENU_TOGGLE_DEVTOOLS => {
            #[cfg(debug_assertions)]
            {
                if window.is_devtools_open() {
                    window.close_devtools();
                } else {
                    window.open_devtools();
                }
            }
            Ok(())
        }
        _ => Ok(()),
    };
    if let Err(err) = result {
        log::warn!(target: SHELL_SOURCE, "menu action {:?} failed: {err}", event.id());
    }
}

/// Signals the supervisor to shut down and waits (bounded) for its report.
pub fn handle_exit<R: Runtime>(app: &AppHandle<R>) {
    let Some(state) = app.try_state::<DesktopState>() else {
        return;
    };
    let exit = state.exit.lock().ok().and_then(|mut guard| guard.take());
    let Some(exit) = exit else {
        return;
    };
    let _ = exit.send(());

    let done = state.done.lock().ok().and_then(|mut guard| guard.take());
    match done.map(|rx| rx.recv_timeout(SHUTDOWN_ACK_TIMEOUT)) {
        Some(Ok(report)) => {
            log::info!(
                target: SHELL_SOURCE,
                "shutdown complete: {}",
                serde_json::to_string(&report).unwrap_or_default()
            );
        }
        Some(Err(_)) => log::warn!(
            target: SHELL_SOURCE,
            "supervisor did not finish shutdown within {}s",
            SHUTDOWN_ACK_TIMEOUT.as_secs()
        ),
        None => {}
    }
}

#[tauri::command]
pub fn relay_console(state: State<'_, DesktopState>, level: String, message: String) {
    state.bus.surface(SurfaceEvent::Console { level, message });
}

#[tauri::command]
pub fn launch_status(state: State<'_, DesktopState>) -> ShellStatus {
    state.status.borrow().clone()
}
