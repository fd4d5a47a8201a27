//! Terminal UI rendering
//!
//! Draws the page list, the current page with its affordances, every open
//! progress surface and the modal overlays.

use crate::app::{kind_title, App, InputMode, StatusModalType};
use crate::presentation::{lock_screen, Affordance, ProgressSurface, SurfaceMarker, Tone};
use crate::status::Percent;
use crate::view::PageKind;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, BorderType, Borders, Clear, Gauge, List, ListItem, Paragraph, Wrap},
    Frame,
};

const SURFACE_HEIGHT: u16 = 7;

pub fn draw(frame: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(0)
        .constraints([
            Constraint::Length(3), // Title & Status Bar
            Constraint::Min(10),   // Pages and current page
            Constraint::Length(2), // Command hints
        ])
        .split(frame.area());

    draw_title_and_status(frame, chunks[0], app);

    let body = if app.show_operation_sidebar {
        let main_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(40), Constraint::Length(34)])
            .split(chunks[1]);
        draw_operation_sidebar(frame, main_chunks[1], app);
        main_chunks[0]
    } else {
        chunks[1]
    };

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(body);
    draw_page_list(frame, columns[0], app);
    draw_current_page(frame, columns[1], app);

    draw_command_hints(frame, chunks[2], app);
    draw_surfaces(frame, columns[1], app);

    if let InputMode::StatusModal(modal_type) = &app.input_mode {
        draw_status_modal(frame, modal_type);
    }
}

fn draw_title_and_status(frame: &mut Frame, area: Rect, app: &App) {
    let running = app.operations().iter().filter(|op| op.running).count();
    let status_text = if running > 0 {
        format!("{} operations active", running)
    } else {
        "Ready".to_string()
    };

    let title_text = format!(" LuaTools Operations │ {} │ {} ", app.current.title, status_text);

    let title = Paragraph::new(title_text)
        .style(Style::default().fg(Color::White).bg(Color::DarkGray))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .border_type(BorderType::Rounded),
        )
        .alignment(Alignment::Center);

    frame.render_widget(title, area);
}

fn draw_page_list(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            let marker = if page.url == app.current.url { "▶ " } else { "  " };
            let content = Line::from(vec![
                Span::styled(marker, Style::default().fg(Color::Green)),
                Span::raw(page.title.clone()),
            ]);

            if i == app.selected {
                ListItem::new(content).style(
                    Style::default()
                        .bg(Color::DarkGray)
                        .add_modifier(Modifier::BOLD),
                )
            } else {
                ListItem::new(content)
            }
        })
        .collect();

    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .border_type(BorderType::Rounded)
            .title(" Pages "),
    );

    frame.render_widget(list, area);
}

fn draw_current_page(frame: &mut Frame, area: Rect, app: &App) {
    let heading = Style::default()
        .fg(Color::Cyan)
        .add_modifier(Modifier::BOLD);

    let mut content = vec![
        Line::from(Span::styled(app.current.title.clone(), heading)),
        Line::from(Span::styled(
            app.current.url.to_string(),
            Style::default().fg(Color::DarkGray),
        )),
        Line::from(""),
    ];

    let kind = match app.page_kind() {
        PageKind::App(appid) => format!("Game page · appid {}", appid),
        PageKind::Workshop { appid, pubfile_id } => {
            format!("Workshop item {} · appid {}", pubfile_id, appid)
        }
        PageKind::Other => "No game on this page".to_string(),
    };
    content.push(Line::from(kind));
    content.push(Line::from(""));

    if app.is_loading() {
        content.push(Line::from(Span::styled(
            "Loading...",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::ITALIC),
        )));
    } else {
        let affordances = app.affordances();
        if affordances.is_empty() {
            content.push(Line::from(Span::styled(
                "No LuaTools actions here",
                Style::default().fg(Color::DarkGray),
            )));
        }
        for affordance in &affordances {
            content.push(affordance_line(affordance));
        }
    }

    if let Some(message) = &app.message {
        content.push(Line::from(""));
        content.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Yellow),
        )));
    }

    let page = Paragraph::new(content)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .border_type(BorderType::Rounded)
                .title(" Page "),
        )
        .wrap(Wrap { trim: true });

    frame.render_widget(page, area);
}

fn affordance_line(affordance: &Affordance) -> Line<'static> {
    let (key, color) = match affordance {
        Affordance::AddViaLuaTools(_) => ("[a] ", Color::Green),
        Affordance::WorkshopDownload { .. } => ("[w] ", Color::Green),
        Affordance::RestartSteam => ("    ", Color::Yellow),
        Affordance::Icon => ("    ", Color::Cyan),
    };
    Line::from(vec![
        Span::styled(key, Style::default().fg(Color::Yellow)),
        Span::styled(
            format!("⟦ {} ⟧", affordance.label()),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
    ])
}

/// Progress surfaces stack from the bottom of the page area.
fn draw_surfaces(frame: &mut Frame, area: Rect, app: &App) {
    let screen = lock_screen(&app.screen);
    let mut bottom = area.y + area.height;

    for (marker, surface) in screen.surfaces() {
        if bottom < area.y + SURFACE_HEIGHT {
            break;
        }
        bottom -= SURFACE_HEIGHT;
        let rect = Rect {
            x: area.x + 2,
            y: bottom,
            width: area.width.saturating_sub(4),
            height: SURFACE_HEIGHT,
        };
        draw_surface(frame, rect, *marker, surface);
    }
}

fn draw_surface(frame: &mut Frame, area: Rect, marker: SurfaceMarker, surface: &ProgressSurface) {
    frame.render_widget(Clear, area);

    let border = match surface.tone {
        Tone::Working => Color::Cyan,
        Tone::Success => Color::Green,
        Tone::Error => Color::Red,
        Tone::Neutral => Color::Yellow,
    };
    let block = Block::default()
        .title(format!(" {} ", surface.title))
        .title_bottom(format!(" {} · {} ", kind_title(marker.kind), marker.entity))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .border_type(BorderType::Rounded);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(1),
            Constraint::Min(1),
        ])
        .split(inner);

    let status = Paragraph::new(surface.status_line.clone())
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: true });
    frame.render_widget(status, rows[0]);

    if surface.progress.visible {
        let gauge = match surface.progress.fill {
            Percent::Known(pct) => Gauge::default()
                .gauge_style(Style::default().fg(border).bg(Color::DarkGray))
                .percent(u16::from(pct.min(100))),
            Percent::Indeterminate => Gauge::default()
                .gauge_style(Style::default().fg(border).bg(Color::DarkGray))
                .percent(5)
                .label("…"),
        };
        frame.render_widget(gauge, rows[1]);
    }

    let mut buttons = Vec::new();
    if let Some(cancel) = surface.cancel.filter(|c| c.visible) {
        let style = if cancel.pending {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default().fg(Color::Red)
        };
        buttons.push(Span::styled("[c] ", Style::default().fg(Color::Yellow)));
        buttons.push(Span::styled(format!("{}  ", cancel.label()), style));
    }
    buttons.push(Span::styled("[h] ", Style::default().fg(Color::Yellow)));
    buttons.push(Span::raw(surface.dismiss.label()));

    let actions = Paragraph::new(Line::from(buttons)).alignment(Alignment::Right);
    frame.render_widget(actions, rows[2]);
}

fn draw_command_hints(frame: &mut Frame, area: Rect, app: &App) {
    let hints = match &app.input_mode {
        InputMode::Normal => {
            vec![Line::from(vec![
                Span::styled("[Enter] ", Style::default().fg(Color::Green)),
                Span::raw("Open  "),
                Span::styled("[Bksp] ", Style::default().fg(Color::Yellow)),
                Span::raw("Back  "),
                Span::styled("[a/f/u/w] ", Style::default().fg(Color::Green)),
                Span::raw("Add/Fix/Un-fix/Workshop  "),
                Span::styled("[c] ", Style::default().fg(Color::Red)),
                Span::raw("Cancel  "),
                Span::styled("[h/p] ", Style::default().fg(Color::Yellow)),
                Span::raw("Hide/Show  "),
                Span::styled("[?] ", Style::default().fg(Color::Cyan)),
                Span::raw("Help  "),
                Span::styled("[q] ", Style::default().fg(Color::Red)),
                Span::raw("Quit"),
            ])]
        }
        InputMode::StatusModal(_) => {
            vec![Line::from(vec![
                Span::styled("[Any Key] ", Style::default().fg(Color::Yellow)),
                Span::raw("Close"),
            ])]
        }
    };

    let hints_widget = Paragraph::new(hints)
        .block(
            Block::default()
                .borders(Borders::TOP)
                .border_style(Style::default().fg(Color::DarkGray)),
        )
        .alignment(Alignment::Center);

    frame.render_widget(hints_widget, area);
}

fn draw_operation_sidebar(frame: &mut Frame, area: Rect, app: &App) {
    let operations = app.operations();
    let mut content = Vec::new();

    if operations.is_empty() {
        content.push(Line::from("No operations yet"));
    }
    for op in &operations {
        let icon = if op.running { "⏳" } else { "✔" };
        let state = op
            .last
            .as_ref()
            .map(|update| update.state.name())
            .unwrap_or("starting");
        let hidden = if op.surface_open { "" } else { " (hidden)" };
        content.push(Line::from(format!(
            "{} {} {}: {}{}",
            icon,
            kind_title(op.marker.kind),
            op.marker.entity,
            state,
            hidden
        )));
    }

    let sidebar = Paragraph::new(content)
        .block(
            Block::default()
                .borders(Borders::LEFT)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(" Operations "),
        )
        .wrap(Wrap { trim: true });

    frame.render_widget(sidebar, area);
}

fn centered_rect(width_percent: u16, height_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - height_percent) / 2),
            Constraint::Percentage(height_percent),
            Constraint::Percentage((100 - height_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - width_percent) / 2),
            Constraint::Percentage(width_percent),
            Constraint::Percentage((100 - width_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn draw_status_modal(frame: &mut Frame, modal_type: &StatusModalType) {
    let area = centered_rect(60, 40, frame.area());
    frame.render_widget(Clear, area);

    match modal_type {
        StatusModalType::Error {
            title,
            details,
            suggestions,
        } => draw_error_modal(frame, area, title, details, suggestions),
        StatusModalType::Help => draw_help_modal(frame, area),
    }
}

fn draw_error_modal(
    frame: &mut Frame,
    area: Rect,
    title: &str,
    details: &str,
    suggestions: &[String],
) {
    let block = Block::default()
        .title(format!(" ✖ {} ", title))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Red))
        .border_type(BorderType::Rounded);

    let mut content = vec![Line::from("")];

    for line in details.lines() {
        content.push(Line::from(vec![Span::styled(
            line,
            Style::default().fg(Color::White),
        )]));
    }

    if !suggestions.is_empty() {
        content.push(Line::from(""));
        content.push(Line::from(vec![Span::styled(
            "Suggestions:",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )]));

        for suggestion in suggestions {
            content.push(Line::from(vec![
                Span::styled("• ", Style::default().fg(Color::Yellow)),
                Span::raw(suggestion),
            ]));
        }
    }

    content.push(Line::from(""));
    content.push(Line::from(vec![Span::styled(
        "Press any key to continue",
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::ITALIC),
    )]));

    let paragraph = Paragraph::new(content)
        .block(block)
        .alignment(Alignment::Left)
        .wrap(Wrap { trim: true });

    frame.render_widget(paragraph, area);
}

fn draw_help_modal(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Help ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .border_type(BorderType::Rounded);

    let keys = [
        ("j/k ↑/↓", "Select a page"),
        ("Enter", "Open the selected page"),
        ("Backspace", "Go back"),
        ("r", "Reload the page"),
        ("a", "Add the game via LuaTools"),
        ("f", "Apply the available fix"),
        ("u", "Remove an applied fix"),
        ("w", "Download the workshop item"),
        ("c", "Cancel the running operation"),
        ("h / p", "Hide or show the popup"),
        ("x", "Stop following the operation"),
        ("o", "Toggle the operations sidebar"),
        ("q", "Quit"),
    ];

    let content: Vec<Line> = keys
        .iter()
        .map(|(key, action)| {
            Line::from(vec![
                Span::styled(format!("{:>10}  ", key), Style::default().fg(Color::Yellow)),
                Span::raw(*action),
            ])
        })
        .collect();

    let paragraph = Paragraph::new(content).block(block);
    frame.render_widget(paragraph, area);
}
