//! C4: the headless terminal state engine. One `TerminalEngine` per session, fed by the
//! session manager's live output events (or, on cold start, by replaying the asciicast
//! log from offset 0); produces `Snapshot`s and plain-text renders on demand.

pub mod snapshot;

use std::path::Path;
use std::sync::Arc;

use alacritty_terminal::event::{Event as AlacEvent, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::sync::FairMutex;
use alacritty_terminal::term::cell::Flags as CellFlags;
use alacritty_terminal::term::{Config as TermConfig, Term, TermMode};
use alacritty_terminal::vte::ansi::{Color as AnsiColor, NamedColor, Processor};

use crate::asciicast::{self, EventKind};
use crate::error::Result;
pub use snapshot::{envelope_session_id, Attrs, Cell, Color, Snapshot};

/// Scrollback depth (spec §4.3: "a ring of up to N (default 2000) rows above the viewport").
const DEFAULT_SCROLLBACK: usize = 2000;

struct GridDimensions {
    cols: usize,
    rows: usize,
    scrollback: usize,
}

impl Dimensions for GridDimensions {
    fn total_lines(&self) -> usize {
        self.rows + self.scrollback
    }

    fn screen_lines(&self) -> usize {
        self.rows
    }

    fn columns(&self) -> usize {
        self.cols
    }
}

/// This engine never needs alacritty's own event channel (no PTY-write-back loop, no
/// desktop bell sound); bell state is tracked separately via `bell_rang`.
#[derive(Clone, Default)]
struct NoopListener;

impl EventListener for NoopListener {
    fn send_event(&self, _event: AlacEvent) {}
}

/// Headless per-session terminal emulator (spec §4.3). Not `Send`-shared directly; callers
/// hold it behind a `Mutex`/actor task the way the session manager holds `LiveSession`.
pub struct TerminalEngine {
    term: FairMutex<Term<NoopListener>>,
    processor: std::sync::Mutex<Processor>,
    cols: std::sync::atomic::AtomicU32,
    rows: std::sync::atomic::AtomicU32,
    scrollback_rows: usize,
    bell_rang: std::sync::atomic::AtomicBool,
}

impl TerminalEngine {
    pub fn new(cols: u16, rows: u16, scrollback_rows: usize) -> Self {
        let scrollback_rows = if scrollback_rows == 0 { DEFAULT_SCROLLBACK } else { scrollback_rows };
        let dims = GridDimensions { cols: cols as usize, rows: rows as usize, scrollback: scrollback_rows };
        let term = Term::new(TermConfig::default(), &dims, NoopListener);
        Self {
            term: FairMutex::new(term),
            processor: std::sync::Mutex::new(Processor::new()),
            cols: std::sync::atomic::AtomicU32::new(cols as u32),
            rows: std::sync::atomic::AtomicU32::new(rows as u32),
            scrollback_rows,
            bell_rang: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Rebuild engine state by replaying a session's asciicast log from offset 0 (spec
    /// §4.3: "consumes ... by replay from offset 0 when a snapshot is first requested
    /// after a cold start").
    pub fn replay_from_log(path: &Path, scrollback_rows: usize) -> Result<Self> {
        let mut reader = asciicast::Reader::open(path)?;
        let header = reader.read_header()?;
        let engine = Self::new(header.width, header.height, scrollback_rows);
        let events = reader.read_new_events()?;
        for event in events {
            engine.apply(&event.kind);
        }
        Ok(engine)
    }

    /// Feed one live asciicast event into the emulator (output/resize/input are all
    /// routed through here; `"i"`/`"x"` don't change grid state beyond what the PTY's own
    /// echo already produced via `"o"`).
    pub fn apply(&self, kind: &EventKind) {
        match kind {
            EventKind::Output(text) => self.feed(text.as_bytes()),
            EventKind::Resize { cols, rows } => self.resize(*cols, *rows),
            EventKind::Input(_) | EventKind::Exit(_) => {}
        }
    }

    pub(crate) fn feed(&self, bytes: &[u8]) {
        if bytes.contains(&0x07) {
            self.bell_rang.store(true, std::sync::atomic::Ordering::Relaxed);
        }
        let mut processor = self.processor.lock().expect("vte processor lock poisoned");
        let mut term = self.term.lock();
        processor.advance(&mut *term, bytes);
    }

    /// Resize policy (SPEC_FULL.md §4.3): truncate, don't reflow. Rows that no longer fit
    /// are pushed into scrollback as-is.
    pub(crate) fn resize(&self, cols: u16, rows: u16) {
        self.cols.store(cols as u32, std::sync::atomic::Ordering::Relaxed);
        self.rows.store(rows as u32, std::sync::atomic::Ordering::Relaxed);
        let dims = GridDimensions { cols: cols as usize, rows: rows as usize, scrollback: self.scrollback_rows };
        self.term.lock().resize(dims);
    }

    /// Materialize the current grid into a `Snapshot` (spec §4.3 `getBufferSnapshot`).
    pub fn snapshot(&self) -> Snapshot {
        let term = self.term.lock();
        let grid = term.grid();
        let cols = grid.columns();
        let rows = grid.screen_lines();
        let display_offset = grid.display_offset();

        let mut cells = Vec::with_capacity(cols * rows);
        for row_idx in 0..rows {
            let line = Line(row_idx as i32 - display_offset as i32);
            for col_idx in 0..cols {
                let point = Point::new(line, Column(col_idx));
                let cell = &grid[point];
                cells.push(Cell {
                    ch: cell.c,
                    fg: convert_color(cell.fg),
                    bg: convert_color(cell.bg),
                    attrs: convert_flags(cell.flags),
                });
            }
        }

        let cursor_point = grid.cursor.point;
        Snapshot {
            cols: cols as u32,
            rows: rows as u32,
            viewport_y: display_offset as i32,
            cursor_x: cursor_point.column.0 as i32,
            cursor_y: cursor_point.line.0 as i32,
            cursor_visible: term.mode().contains(TermMode::SHOW_CURSOR),
            bell_rang: self.bell_rang.swap(false, std::sync::atomic::Ordering::Relaxed),
            cells,
        }
    }

    pub fn plain_text(&self, with_styles: bool) -> String {
        self.snapshot().to_plain_text(with_styles)
    }
}

fn convert_color(color: AnsiColor) -> Color {
    match color {
        AnsiColor::Named(NamedColor::Foreground) | AnsiColor::Named(NamedColor::Background) => Color::Default,
        AnsiColor::Named(named) => Color::Palette(named as u8),
        AnsiColor::Indexed(idx) => Color::Palette(idx),
        AnsiColor::Spec(rgb) => Color::Rgb(rgb.r, rgb.g, rgb.b),
    }
}

fn convert_flags(flags: CellFlags) -> Attrs {
    Attrs {
        bold: flags.contains(CellFlags::BOLD),
        italic: flags.contains(CellFlags::ITALIC),
        underline: flags.contains(CellFlags::UNDERLINE)
            || flags.contains(CellFlags::DOUBLE_UNDERLINE)
            || flags.contains(CellFlags::UNDERCURL),
        strikethrough: flags.contains(CellFlags::STRIKEOUT),
        dim: flags.contains(CellFlags::DIM),
        inverse: flags.contains(CellFlags::INVERSE),
        invisible: flags.contains(CellFlags::HIDDEN),
    }
}

/// One `TerminalEngine` per session, keyed the same way the session manager keys
/// `LiveSession` (spec §3.2: "terminal state engine exclusively owns emulator state").
pub struct TerminalRegistry {
    engines: dashmap::DashMap<crate::session::SessionId, Arc<TerminalEngine>>,
}

impl Default for TerminalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self { engines: dashmap::DashMap::new() }
    }

    pub fn get_or_insert_with(
        &self,
        id: crate::session::SessionId,
        make: impl FnOnce() -> TerminalEngine,
    ) -> Arc<TerminalEngine> {
        self.engines.entry(id).or_insert_with(|| Arc::new(make())).clone()
    }

    pub fn get(&self, id: crate::session::SessionId) -> Option<Arc<TerminalEngine>> {
        self.engines.get(&id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: crate::session::SessionId) {
        self.engines.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_is_readable_in_snapshot() {
        let engine = TerminalEngine::new(10, 2, 100);
        engine.feed(b"hi\r\n");
        let text = engine.plain_text(false);
        assert!(text.starts_with("hi"));
    }

    #[test]
    fn resize_updates_grid_dimensions() {
        let engine = TerminalEngine::new(10, 2, 100);
        engine.resize(20, 5);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.cols, 20);
        assert_eq!(snapshot.rows, 5);
    }

    #[test]
    fn bell_flag_is_consumed_once() {
        let engine = TerminalEngine::new(10, 2, 100);
        engine.feed(b"\x07");
        assert!(engine.snapshot().bell_rang);
        assert!(!engine.snapshot().bell_rang);
    }

    #[test]
    fn registry_reuses_engine_for_same_session() {
        let registry = TerminalRegistry::new();
        let id = crate::session::SessionId::new();
        let a = registry.get_or_insert_with(id, || TerminalEngine::new(80, 24, 100));
        let b = registry.get(id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
