//! GameMotion desktop shell.
//!
//! Starts the Python backend and the Next.js frontend dev server, waits for
//! them to come up, shows the frontend in a single managed window, and
//! tree-kills both services when the app exits.

pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod resolver;
pub mod shutdown;
pub mod supervisor;
pub mod surface;

#[cfg(feature = "desktop")]
mod desktop;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use std::sync::Mutex;

    use tauri::{Manager, RunEvent};

    use crate::config::ShellConfig;
    use crate::events::EventBus;
    use crate::resolver::Platform;
    use crate::supervisor::{LaunchPlan, Supervisor};

    tauri::Builder::default()
        .plugin(
            tauri_plugin_log::Builder::default()
                .level(if cfg!(debug_assertions) {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                })
                .build(),
        )
        .menu(|handle| desktop::build_menu(handle))
        .on_menu_event(|app, event| desktop::handle_menu_event(app, event))
        .invoke_handler(tauri::generate_handler![
            desktop::relay_console,
            desktop::launch_status
        ])
        .setup(|app| {
            let config = ShellConfig::from_env();
            log::info!(
                target: "shell",
                "starting shell root={} frontend_port={} dev_mode={}",
                config.root_dir.display(),
                config.frontend_port,
                config.dev_mode
            );

            let (bus, events) = EventBus::channel();
            let window = desktop::build_main_window(app.handle(), &config, bus.clone())?;
            let plan = LaunchPlan::from_config(&config, Platform::current());
            let supervisor = Supervisor::new(
                plan,
                desktop::TauriSurface::new(window),
                bus.clone(),
                events,
            );

            let (exit_tx, exit_rx) = tokio::sync::oneshot::channel::<()>();
            let (done_tx, done_rx) = std::sync::mpsc::channel();
            app.manage(desktop::DesktopState {
                bus,
                status: supervisor.subscribe(),
                exit: Mutex::new(Some(exit_tx)),
                done: Mutex::new(Some(done_rx)),
            });

            tauri::async_runtime::spawn(async move {
                let report = supervisor
                    .run_until(async {
                        let _ = exit_rx.await;
                    })
                    .await;
                let _ = done_tx.send(report);
            });
            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| {
            if let RunEvent::Exit = event {
                desktop::handle_exit(app);
            }
        });
}
