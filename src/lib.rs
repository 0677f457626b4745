// Privileged command-execution bridge for root manager module WebUIs.
//
// The library is usable headless (CLI, HTTP); the Tauri desktop host is
// behind the `desktop` feature.

// Declare modules
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod display;
pub mod error;
pub mod exec;
pub mod modules;
pub mod session;
pub mod web_server;

#[cfg(feature = "desktop")]
pub mod commands;

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    use commands::bridge::{self as bridge_commands, BridgeRegistry, MODULE_SCHEME};
    use tauri::{Manager, WindowEvent};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match config::BridgeConfig::load(None) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Using default configuration: {}", e);
            config::BridgeConfig::default()
        }
    };
    let modules_root = config.modules.root.clone();

    let result = tauri::Builder::default()
        .manage(BridgeRegistry::new(config))
        .register_uri_scheme_protocol(MODULE_SCHEME, move |ctx, request| {
            bridge_commands::serve_module_asset(&modules_root, ctx.webview_label(), &request)
        })
        .on_window_event(|window, event| {
            if let WindowEvent::Destroyed = event {
                let app = window.app_handle().clone();
                let label = window.label().to_string();
                tauri::async_runtime::spawn(async move {
                    app.state::<BridgeRegistry>().detach(&label).await;
                });
            }
        })
        .invoke_handler(tauri::generate_handler![
            bridge_commands::open_module_webui,
            bridge_commands::set_secondary_screen,
            bridge_commands::ksu_exec,
            bridge_commands::ksu_exec_callback,
            bridge_commands::ksu_spawn,
            bridge_commands::ksu_cancel,
            bridge_commands::ksu_toast,
            bridge_commands::ksu_full_screen,
            bridge_commands::ksu_is_secondary_page,
            bridge_commands::ksu_module_info,
            bridge_commands::ksu_list_all_kpm,
            bridge_commands::ksu_control_kpm,
        ])
        .run(tauri::generate_context!());

    if let Err(e) = result {
        log::error!("Error while running tauri application: {}", e);
        std::process::exit(1);
    }
}
