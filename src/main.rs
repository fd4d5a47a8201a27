//! ltops - LuaTools operations in the terminal
//!
//! Main entry point: wires the backend client, the operation controller and
//! the navigation watcher to the terminal host.

mod app;
mod backend;
mod backend_api;
mod config;
mod guard;
mod launcher;
mod poller;
mod presentation;
mod status;
mod ui;
mod view;

use anyhow::{Context, Result};
use app::{App, InputMode};
use backend::PluginClient;
use backend_api::BackendApiClient;
use config::Config;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use guard::OperationGuard;
use launcher::OperationController;
use log::{debug, error, info};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{io, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use view::{NavigationWatcher, ViewCoordinator};

#[tokio::main]
async fn main() -> Result<()> {
    // Defaults to OFF so log lines never land on the alternate screen.
    // Set RUST_LOG=debug for debugging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("off")).init();

    info!("Starting ltops");

    let config = Config::from_env().context("Invalid configuration")?;
    let api = BackendApiClient::new(config.endpoint.clone(), config.plugin.clone())
        .context("Cannot reach the LuaTools backend")?;
    let backend: Arc<dyn backend::OperationBackend> = Arc::new(PluginClient::new(api));

    let screen = presentation::shared_screen();
    let controller = OperationController::new(
        backend.clone(),
        OperationGuard::new(config.guard_scope),
        screen.clone(),
    )
    .with_poll_interval(config.poll_override)
    .with_fix_urls(config.fix_urls.clone());
    let coordinator = ViewCoordinator::new(screen.clone(), backend);

    let (mut app, location, nav_events) =
        App::new(&config.start_url, controller.clone(), screen);
    let shutdown = CancellationToken::new();
    let watcher =
        NavigationWatcher::new(coordinator, location, nav_events, config.nav_poll_interval)
            .spawn(shutdown.clone());

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    shutdown.cancel();
    let reports = controller.shutdown().await;
    for report in &reports {
        debug!(
            "{} for {} ended as {:?} after {} ticks",
            report.kind, report.entity, report.outcome, report.ticks
        );
    }
    if let Err(e) = watcher.await {
        error!("Navigation watcher panicked: {:?}", e);
    }

    if let Err(err) = res {
        error!("Error: {:?}", err);
        println!("{:?}", err)
    }

    info!("ltops terminated");
    Ok(())
}

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> Result<()> {
    loop {
        app.tick();

        terminal.draw(|frame| ui::draw(frame, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                debug!("Key pressed: {:?} in mode: {:?}", key, app.input_mode);

                match &app.input_mode {
                    InputMode::Normal => {
                        if app.message.is_some() {
                            app.clear_message();
                        }
                        handle_normal_mode(app, key).await;
                    }
                    // Any key dismisses an alert; it is never shown again.
                    InputMode::StatusModal(_) => app.close_modal(),
                }
            }
        }

        if app.should_quit {
            info!("Application quit requested");
            return Ok(());
        }
    }
}

async fn handle_normal_mode(app: &mut App, key: event::KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => {
            app.should_quit = true;
        }
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
            app.should_quit = true;
        }
        KeyCode::Char('j') | KeyCode::Down => app.next(),
        KeyCode::Char('k') | KeyCode::Up => app.previous(),
        KeyCode::Enter => app.open_selected(),
        KeyCode::Backspace => app.go_back(),
        KeyCode::Char('r') => app.reload(),
        KeyCode::Char('a') => app.install_current().await,
        KeyCode::Char('f') => app.apply_fix_current().await,
        KeyCode::Char('u') => app.unfix_current().await,
        KeyCode::Char('w') => app.workshop_download_current().await,
        KeyCode::Char('c') => app.cancel_current().await,
        KeyCode::Char('h') => app.hide_current(),
        KeyCode::Char('p') => app.reopen_current(),
        KeyCode::Char('x') => app.detach_current(),
        KeyCode::Char('o') | KeyCode::Char('O') => {
            app.show_operation_sidebar = !app.show_operation_sidebar;
        }
        KeyCode::Char('?') => app.show_help(),
        _ => {}
    }
}
