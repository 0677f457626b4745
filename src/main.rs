// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

/// Desktop entry point for the module WebUI host
///
/// This is a thin wrapper that delegates to the library crate.
/// All bridge code and Tauri setup lives in lib.rs.
fn main() {
    ksu_webui_lib::run();
}
