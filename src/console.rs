//! Operator console: renders status frames and collects commands.
//!
//! Raw-mode terminal with an alternate screen. The event wait doubles as
//! the idle tick: when no key arrives within the poll interval a tick is
//! reported so the caller refreshes status. Resize re-renders the last
//! frame without consuming any pending command.

use std::io;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Terminal,
};

use crate::config::CutoverOptions;
use crate::orchestrator::{OperatorCommand, Orchestrator};
use crate::session::SessionPhase;
use crate::status::RenderModel;

/// What the console observed while waiting for input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEvent {
    Command(OperatorCommand),
    /// Idle timeout elapsed; refresh status.
    Tick,
    /// Terminal resized; re-render the last frame.
    Resize,
}

/// Terminal wrapper owning setup and teardown.
pub struct Console {
    terminal: Terminal<CrosstermBackend<io::Stdout>>,
    last: RenderModel,
}

impl Console {
    /// Enter raw mode on the alternate screen.
    pub fn new() -> io::Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;
        Ok(Self {
            terminal,
            last: RenderModel::default(),
        })
    }

    /// Draw a frame and remember it for resize re-renders.
    pub fn render(&mut self, model: &RenderModel) -> io::Result<()> {
        self.last = model.clone();
        self.draw()
    }

    /// Re-render the last frame.
    pub fn rerender(&mut self) -> io::Result<()> {
        self.draw()
    }

    fn draw(&mut self) -> io::Result<()> {
        let model = &self.last;
        let mut lines: Vec<Line> = Vec::with_capacity(model.pairs.len() + 5);

        lines.push(Line::from(model.summary.clone()));
        lines.push(Line::from(Span::styled(
            model.legend.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::default());
        if let Some(banner) = &model.banner {
            lines.push(Line::from(banner.clone()));
            lines.push(Line::default());
        }
        for pair in &model.pairs {
            let style = if pair.is_error {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            lines.push(Line::from(Span::styled(
                format!(" {}", pair.text),
                style,
            )));
        }

        self.terminal.draw(|frame| {
            frame.render_widget(Paragraph::new(lines), frame.area());
        })?;
        Ok(())
    }

    /// Wait up to `timeout` for the next operator action.
    pub fn next_event(&mut self, timeout: Duration) -> io::Result<ConsoleEvent> {
        if !event::poll(timeout)? {
            return Ok(ConsoleEvent::Tick);
        }
        match event::read()? {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                let command = match key.code {
                    KeyCode::Char(c) => match c.to_ascii_lowercase() {
                        'q' => Some(OperatorCommand::Quit),
                        's' => Some(OperatorCommand::Start),
                        'e' => Some(OperatorCommand::EnableWrites),
                        'm' => Some(OperatorCommand::Promote),
                        _ => None,
                    },
                    _ => None,
                };
                Ok(command.map_or(ConsoleEvent::Tick, ConsoleEvent::Command))
            }
            Event::Resize(_, _) => Ok(ConsoleEvent::Resize),
            _ => Ok(ConsoleEvent::Tick),
        }
    }

    /// Leave the alternate screen and restore the terminal.
    pub fn restore(&mut self) -> io::Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }
}

/// Drive a connected session through the console until it terminates.
///
/// Returns the terminal phase: `Promoted` after a completed cutover,
/// `Quit` when the operator left early.
pub async fn run(
    mut orchestrator: Orchestrator,
    options: &CutoverOptions,
) -> io::Result<SessionPhase> {
    let mut console = Console::new()?;
    let result = event_loop(&mut orchestrator, &mut console, options).await;
    // Restore before surfacing any error so the shell is usable again.
    console.restore()?;
    result?;
    Ok(orchestrator.phase())
}

async fn event_loop(
    orchestrator: &mut Orchestrator,
    console: &mut Console,
    options: &CutoverOptions,
) -> io::Result<()> {
    loop {
        let model = orchestrator.poll().await;
        if orchestrator.is_finished() {
            break;
        }
        console.render(&model)?;

        match console.next_event(options.poll_interval)? {
            ConsoleEvent::Command(command) => {
                orchestrator.apply(command).await;
                if orchestrator.is_finished() {
                    break;
                }
            }
            ConsoleEvent::Resize => console.rerender()?,
            ConsoleEvent::Tick => {}
        }
    }
    Ok(())
}
