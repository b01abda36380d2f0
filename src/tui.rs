#![cfg(feature = "tui")]

use crate::chat::{CompletedTurn, Orchestrator};
use crate::provider::{OptionOverrides, SessionCanceller, StylePreset};
use anyhow::Context;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use std::io;
use tokio::sync::mpsc;

const HELP: &str =
    "Enter sends, Esc cancels a reply (or quits). Commands: /quit, /clear, /new [title], /style <preset>, /guardrails on|off";

#[derive(Debug, Clone)]
struct ChatLine {
    role: &'static str,
    text: String,
}

enum StreamMsg {
    Chunk(String),
    Done(CompletedTurn),
}

struct ActiveTurn {
    canceller: SessionCanceller,
    rx: mpsc::UnboundedReceiver<StreamMsg>,
}

struct View<'a> {
    orch: &'a mut Orchestrator,
    thread_id: String,
    lines: Vec<ChatLine>,
    input: String,
    active: Option<ActiveTurn>,
}

pub async fn run_tui(
    orch: &mut Orchestrator,
    thread: Option<String>,
    default_style: Option<StylePreset>,
) -> anyhow::Result<()> {
    let thread_id = match thread {
        Some(key) => orch.resolve_id(&key)?,
        None => {
            let id = orch.create_thread("New chat");
            if let Some(style) = default_style {
                orch.set_style(&id, style)?;
            }
            id
        }
    };

    let mut view = View {
        orch,
        thread_id,
        lines: Vec::new(),
        input: String::new(),
        active: None,
    };
    view.reload();

    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("enter alt screen")?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;

    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Event>();
    std::thread::spawn(move || {
        while let Ok(ev) = crossterm::event::read() {
            if ev_tx.send(ev).is_err() {
                break;
            }
        }
    });

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(33));

    let res = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = draw(&mut terminal, &view) {
                    break Err(e);
                }
            }
            Some(ev) = ev_rx.recv() => {
                if let Event::Key(key) = ev {
                    match view.handle_key(key) {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
            Some(msg) = async {
                match &mut view.active {
                    Some(turn) => turn.rx.recv().await,
                    None => None,
                }
            } => {
                view.on_stream(msg);
            }
        }
    };

    if let Some(turn) = view.active.take() {
        turn.canceller.cancel();
    }

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen).ok();
    terminal.show_cursor().ok();

    res
}

impl View<'_> {
    fn reload(&mut self) {
        self.lines = vec![ChatLine {
            role: "system",
            text: HELP.to_string(),
        }];
        if let Some(t) = self.orch.thread(&self.thread_id) {
            for m in t.messages() {
                self.lines.push(ChatLine {
                    role: m.role().as_str(),
                    text: m.text().to_string(),
                });
            }
        }
    }

    fn note(&mut self, text: impl Into<String>) {
        self.lines.push(ChatLine {
            role: "system",
            text: text.into(),
        });
    }

    /// Returns Ok(true) when the UI should exit.
    fn handle_key(&mut self, key: KeyEvent) -> anyhow::Result<bool> {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Ok(true);
        }

        match key.code {
            KeyCode::Esc => match &self.active {
                Some(turn) => turn.canceller.cancel(),
                None => return Ok(true),
            },
            KeyCode::Char(c) => self.input.push(c),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Enter => {
                let msg = self.input.trim().to_string();
                self.input.clear();
                if !msg.is_empty() {
                    return self.submit(msg);
                }
            }
            _ => {}
        }
        Ok(false)
    }

    fn submit(&mut self, msg: String) -> anyhow::Result<bool> {
        if msg == "/quit" {
            return Ok(true);
        }
        if let Some(cmd) = msg.strip_prefix('/') {
            self.command(cmd);
            return Ok(false);
        }

        if self.active.is_some() {
            self.note("(reply in progress; press Esc to cancel)");
            return Ok(false);
        }

        let (tx, rx) = mpsc::unbounded_channel::<StreamMsg>();
        let done_tx = tx.clone();
        let started = self.orch.send_with(
            &self.thread_id,
            &msg,
            &OptionOverrides::default(),
            move |chunk| {
                let _ = tx.send(StreamMsg::Chunk(chunk));
            },
            move |done| {
                let _ = done_tx.send(StreamMsg::Done(done));
            },
        );
        let canceller = match started {
            Ok(c) => c,
            Err(e) => {
                self.lines.push(ChatLine {
                    role: "error",
                    text: e.to_string(),
                });
                return Ok(false);
            }
        };

        self.lines.push(ChatLine {
            role: "user",
            text: msg,
        });
        self.lines.push(ChatLine {
            role: "assistant",
            text: String::new(),
        });
        self.active = Some(ActiveTurn { canceller, rx });

        Ok(false)
    }

    fn command(&mut self, cmd: &str) {
        let (name, rest) = cmd.split_once(' ').unwrap_or((cmd, ""));
        let rest = rest.trim();
        let busy = self.active.is_some();
        let res = match name {
            "clear" if busy => Err("wait for the reply to finish".to_string()),
            "clear" => self
                .orch
                .clear_history(&self.thread_id)
                .map(|_| self.reload())
                .map_err(|e| e.to_string()),
            "new" if busy => Err("wait for the reply to finish".to_string()),
            "new" => {
                let title = if rest.is_empty() { "New chat" } else { rest };
                self.thread_id = self.orch.create_thread(title);
                self.reload();
                Ok(())
            }
            "style" => match rest.parse::<StylePreset>() {
                Ok(style) => self
                    .orch
                    .set_style(&self.thread_id, style)
                    .map(|_| self.note(format!("style set to: {style}")))
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            "guardrails" => {
                let enabled = match rest {
                    "on" => Some(true),
                    "off" => Some(false),
                    _ => None,
                };
                match enabled {
                    Some(on) => self
                        .orch
                        .set_guardrails(&self.thread_id, on)
                        .map(|_| self.note(format!("guardrails {rest}")))
                        .map_err(|e| e.to_string()),
                    None => Err("usage: /guardrails on|off".to_string()),
                }
            }
            other => Err(format!("unknown command: /{other}")),
        };
        if let Err(e) = res {
            self.note(e);
        }
    }

    fn on_stream(&mut self, msg: StreamMsg) {
        match msg {
            StreamMsg::Chunk(t) => {
                if let Some(last) = self.lines.last_mut() {
                    if last.role == "assistant" {
                        last.text.push_str(&t);
                    }
                }
            }
            StreamMsg::Done(done) => {
                self.active = None;
                let result = done.result().clone();
                match self.orch.apply(done) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        let reason = match &result.error {
                            Some(e) => e.to_string(),
                            None => result.finish_reason.to_string(),
                        };
                        self.note(format!("(reply not kept: {reason})"));
                    }
                    Err(e) => self.lines.push(ChatLine {
                        role: "error",
                        text: e.to_string(),
                    }),
                }
            }
        }
    }
}

fn draw(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    view: &View<'_>,
) -> anyhow::Result<()> {
    let header = match view.orch.thread(&view.thread_id) {
        Some(t) => format!(
            "{} ({}, guardrails {})",
            t.title(),
            t.style(),
            if t.guardrails() { "on" } else { "off" }
        ),
        None => "localchat".to_string(),
    };
    let status = if view.active.is_some() {
        "input (generating; Esc cancels)"
    } else {
        "input"
    };

    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(3)])
            .split(f.area());

        let mut text = Text::default();
        for l in &view.lines {
            let style = match l.role {
                "user" | "error" => Style::default().add_modifier(Modifier::BOLD),
                "system" => Style::default().add_modifier(Modifier::DIM),
                _ => Style::default(),
            };
            text.lines.push(Line::styled(format!("{}: ", l.role), style));
            text.lines.extend(Text::from(l.text.clone()).lines);
            text.lines.push(Line::from(""));
        }

        let chat = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(header.clone()))
            .wrap(Wrap { trim: false });

        let input_w = Paragraph::new(view.input.clone())
            .block(Block::default().borders(Borders::ALL).title(status));

        f.render_widget(chat, chunks[0]);
        f.render_widget(input_w, chunks[1]);

        let x = chunks[1].x + 1 + view.input.chars().count() as u16;
        let y = chunks[1].y + 1;
        f.set_cursor_position((x.min(chunks[1].x + chunks[1].width.saturating_sub(2)), y));
    })?;
    Ok(())
}
