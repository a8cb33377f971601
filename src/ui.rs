use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use crate::app::{App, FocusPane, InputMode};
use crate::message::{ChatMessage, ChatRole, ChatMode};

const SIDEBAR_WIDTH: u16 = 34;

/// Convert `**bold**` runs in a line of assistant text to styled spans.
fn styled_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("**") {
        if let Some(len) = rest[start + 2..].find("**") {
            if start > 0 {
                spans.push(Span::raw(rest[..start].to_string()));
            }
            spans.push(Span::styled(
                rest[start + 2..start + 2 + len].to_string(),
                Style::default().add_modifier(Modifier::BOLD),
            ));
            rest = &rest[start + 2 + len + 2..];
        } else {
            break;
        }
    }
    if !rest.is_empty() {
        spans.push(Span::raw(rest.to_string()));
    }
    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, body, footer
    let [header_area, body_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);

    let chat_area = if app.show_sidebar {
        let [sidebar_area, main_area] =
            Layout::horizontal([Constraint::Length(SIDEBAR_WIDTH), Constraint::Min(0)])
                .areas(body_area);
        render_sidebar(app, frame, sidebar_area);
        main_area
    } else {
        body_area
    };

    let [thread_area, input_area] =
        Layout::vertical([Constraint::Min(0), Constraint::Length(3)]).areas(chat_area);

    if app.session().is_loading_history() {
        render_history_loading(app, frame, thread_area);
    } else if app.session().messages.is_empty() {
        render_welcome(app, frame, thread_area);
    } else {
        render_thread(app, frame, thread_area);
    }

    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if app.toast.is_some() {
        render_toast(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let mode_tab = |mode: ChatMode, key: &str| {
        let label = format!(" {} ({}) ", mode.display_name(), key);
        if app.mode == mode {
            Span::styled(label, Style::default().fg(Color::Black).bg(Color::Cyan))
        } else {
            Span::styled(label, Style::default().fg(Color::Gray))
        }
    };

    let title = Line::from(vec![
        Span::styled(" Buddy ", Style::default().fg(Color::Cyan).bold()),
        mode_tab(ChatMode::AskBuddy, "a"),
        mode_tab(ChatMode::MarketTransaction, "m"),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_sidebar(app: &mut App, frame: &mut Frame, area: Rect) {
    let title = if app.sidebar_loading {
        " History (loading…) "
    } else {
        " History "
    };
    let border_style = if app.focus == FocusPane::Sidebar {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(border_style)
        .title(title);

    if app.sidebar_chats.is_empty() {
        let text = if app.sidebar_loading { "" } else { "No chats yet" };
        let empty = Paragraph::new(text)
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(empty, area);
        return;
    }

    let items: Vec<ListItem> = app
        .sidebar_chats
        .iter()
        .map(|chat| {
            let when = crate::message::clock_from_timestamp(chat.created_at.as_deref());
            ListItem::new(vec![
                Line::from(chat.preview()),
                Line::from(Span::styled(when, Style::default().fg(Color::DarkGray))),
            ])
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(Style::default().bg(Color::Cyan).fg(Color::Black))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, area, &mut app.sidebar_state);
}

fn render_history_loading(app: &App, frame: &mut Frame, area: Rect) {
    let dots = ".".repeat((app.animation_frame + 1) as usize);
    let text = Paragraph::new(format!("\nLoading chat{dots}"))
        .style(Style::default().fg(Color::DarkGray))
        .alignment(ratatui::layout::Alignment::Center)
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::DarkGray)));
    frame.render_widget(text, area);
}

fn render_welcome(app: &App, frame: &mut Frame, area: Rect) {
    let profile = app.session().profile();
    let mut lines: Vec<Line> = vec![
        Line::default(),
        Line::from(Span::styled(
            profile.title,
            Style::default().fg(Color::Cyan).bold(),
        )),
        Line::from(Span::raw(profile.description)),
        Line::default(),
        Line::from(Span::styled(
            format!("e.g. {}", profile.welcome_placeholder),
            Style::default().fg(Color::DarkGray),
        )),
        Line::default(),
        Line::from(Span::styled(
            "Suggested questions:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for (i, question) in profile.suggested_questions.iter().enumerate() {
        lines.push(Line::from(vec![
            Span::styled(format!("  {}. ", i + 1), Style::default().fg(Color::Cyan)),
            Span::raw(*question),
        ]));
    }

    let welcome = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::DarkGray)));
    frame.render_widget(welcome, area);
}

/// Build the renderable lines for one message.
fn message_lines(msg: &ChatMessage, animation_frame: u8) -> Vec<Line<'static>> {
    let mut lines = Vec::new();

    let (label, label_style) = match msg.role {
        ChatRole::User => ("You", Style::default().fg(Color::Green).bold()),
        ChatRole::Assistant => ("Buddy", Style::default().fg(Color::Cyan).bold()),
    };
    lines.push(Line::from(vec![
        Span::styled(label.to_string(), label_style),
        Span::raw("  "),
        Span::styled(msg.time.clone(), Style::default().fg(Color::DarkGray)),
    ]));

    if msg.pending {
        let dots = ".".repeat((animation_frame + 1) as usize);
        lines.push(Line::from(Span::styled(
            format!("{}{}", msg.content, dots),
            Style::default().fg(Color::DarkGray).italic(),
        )));
    } else {
        for (i, raw) in msg.content.lines().enumerate() {
            let mut line = match msg.role {
                ChatRole::Assistant => styled_line(raw),
                ChatRole::User => Line::from(Span::raw(raw.to_string())),
            };
            // Typing cursor on the last visible line.
            if msg.typing && i == msg.content.lines().count().saturating_sub(1) {
                line.spans.push(Span::styled("▌", Style::default().fg(Color::Cyan)));
            }
            lines.push(line);
        }
        if msg.typing && msg.content.is_empty() {
            lines.push(Line::from(Span::styled("▌", Style::default().fg(Color::Cyan))));
        }
        // Image slots are reserved while typing, then filled in.
        if msg.typing {
            for _ in 0..msg.image_placeholder_count {
                lines.push(Line::from(Span::styled(
                    "[ image loading… ]",
                    Style::default().fg(Color::DarkGray),
                )));
            }
        } else {
            for url in &msg.images {
                lines.push(Line::from(vec![
                    Span::styled("image: ", Style::default().fg(Color::DarkGray)),
                    Span::styled(url.clone(), Style::default().fg(Color::Blue).underlined()),
                ]));
            }
        }
    }

    lines.push(Line::default());
    lines
}

fn render_thread(app: &mut App, frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(format!(" {} ", app.router().display()));
    let inner = block.inner(area);
    app.thread_height = inner.height;
    app.thread_width = inner.width;

    let mut lines: Vec<Line> = Vec::new();
    for msg in &app.session().messages {
        lines.extend(message_lines(msg, app.animation_frame));
    }

    // Estimate wrapped height so the newest message stays in view.
    let wrap_width = inner.width.max(1) as usize;
    let total: u16 = lines
        .iter()
        .map(|line| {
            let chars: usize = line.spans.iter().map(|s| s.content.chars().count()).sum();
            ((chars / wrap_width) + 1) as u16
        })
        .sum();
    if app.stick_to_bottom {
        app.thread_scroll = total.saturating_sub(inner.height);
    } else {
        app.thread_scroll = app.thread_scroll.min(total.saturating_sub(1));
    }

    let thread = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((app.thread_scroll, 0))
        .block(block);
    frame.render_widget(thread, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let session = app.session();
    let editing = app.input_mode == InputMode::Editing;

    let border_style = if editing {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(border_style)
        .title(if session.is_loading() {
            " waiting… Esc to cancel ".to_string()
        } else {
            format!(" {} ", session.profile().bottom_placeholder)
        });

    let input = Paragraph::new(session.input.as_str()).block(block);
    frame.render_widget(input, area);

    if editing {
        let x = area.x + 1 + session.cursor.min(area.width.saturating_sub(2) as usize) as u16;
        frame.set_cursor_position((x, area.y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let hints = match app.input_mode {
        InputMode::Editing => vec![
            Span::styled(" Enter ", key_style),
            Span::styled(" send ", label_style),
            Span::styled(" Esc ", key_style),
            Span::styled(
                if app.session().is_loading() { " cancel " } else { " done " },
                label_style,
            ),
        ],
        InputMode::Normal => {
            let mut hints = vec![
                Span::styled(" i ", key_style),
                Span::styled(" type ", label_style),
                Span::styled(" n ", key_style),
                Span::styled(" new ", label_style),
                Span::styled(" r ", key_style),
                Span::styled(" resume ", label_style),
                Span::styled(" h ", key_style),
                Span::styled(" history ", label_style),
                Span::styled(" a/m ", key_style),
                Span::styled(" mode ", label_style),
            ];
            if app.session().messages.is_empty() {
                hints.extend(vec![
                    Span::styled(" 1-4 ", key_style),
                    Span::styled(" suggested ", label_style),
                ]);
            }
            hints.extend(vec![
                Span::styled(" q ", key_style),
                Span::styled(" quit ", label_style),
            ]);
            hints
        }
    };

    let footer = Paragraph::new(Line::from(hints));
    frame.render_widget(footer, area);
}

fn render_toast(app: &App, frame: &mut Frame, area: Rect) {
    let Some(message) = &app.toast else { return };
    let width = (message.chars().count() as u16 + 4).min(area.width);
    let rect = Rect {
        x: area.width.saturating_sub(width + 1),
        y: area.height.saturating_sub(4),
        width,
        height: 3,
    };
    frame.render_widget(Clear, rect);
    let toast = Paragraph::new(message.as_str())
        .style(Style::default().fg(Color::Black).bg(Color::Yellow))
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(toast, rect);
}
