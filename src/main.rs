use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod app;
mod bus;
mod config;
mod handler;
mod message;
mod router;
mod session;
mod store;
mod transport;
mod tui;
mod ui;

use app::App;
use bus::EventBus;
use config::Config;
use store::LastChatStore;
use transport::HttpTransport;
use tui::EventHandler;

/// Log to a file; stdout/stderr belong to the terminal UI.
fn init_logging() -> Result<()> {
    let log_dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("Could not determine cache directory"))?
        .join("buddy");
    std::fs::create_dir_all(&log_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("buddy.log"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let mut config = Config::load().unwrap_or_else(|_| Config::new());
    // First run with BUDDY_USER_ID set: remember it for later sessions.
    if config.user_id.is_none() {
        if let Ok(user_id) = std::env::var("BUDDY_USER_ID") {
            config.user_id = Some(user_id);
            config.save()?;
        }
    }
    let user_id = config.user_id().ok_or_else(|| {
        anyhow!("no user id configured; set BUDDY_USER_ID or add user_id to the config file")
    })?;

    let transport = Arc::new(HttpTransport::new(
        &config.base_url(),
        &config.project_id(),
        &config.channel(),
    ));
    let store = LastChatStore::new()?;
    let bus = EventBus::new();

    let (ask_tx, mut ask_rx) = mpsc::unbounded_channel();
    let (market_tx, mut market_rx) = mpsc::unbounded_channel();
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let mut bus_rx = bus.subscribe();

    let mut app = App::new(
        user_id,
        transport,
        store,
        bus,
        ask_tx,
        market_tx,
        ui_tx,
    );

    app.restore_last_chats();

    tui::install_panic_hook();
    let mut terminal = tui::init()?;
    let mut events = EventHandler::new();

    tracing::info!(base_url = %config.base_url(), "starting");

    while !app.should_quit {
        terminal.draw(|frame| ui::render(&mut app, frame))?;

        tokio::select! {
            Some(event) = events.next() => handler::handle_event(&mut app, event)?,
            Some(event) = ask_rx.recv() => app.ask.apply(event),
            Some(event) = market_rx.recv() => app.market.apply(event),
            Some(message) = ui_rx.recv() => app.apply_ui(message),
            Ok(signal) = bus_rx.recv() => app.on_signal(signal),
        }
        app.drain_notices();
    }

    tui::restore()?;
    Ok(())
}
