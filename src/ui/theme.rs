use owo_colors::Style;
use std::sync::OnceLock;
use crate::storage::RowOutcome;

static THEME: OnceLock<Theme> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub success: Style,
    pub error: Style,
    pub warn: Style,
    pub info: Style,
    pub dim: Style,
    pub muted: Style,
    /// Ids and other keys in listings
    pub key: Style,
}

impl Theme {
    pub fn detect() -> Self {
        Self::for_terminal(console::Term::stdout().is_term())
    }

    pub fn for_terminal(is_term: bool) -> Self {
        if is_term { Self::colored() } else { Self::plain() }
    }

    pub fn colored() -> Self {
        Self {
            header: Style::new().cyan().bold(),
            success: Style::new().green().bold(),
            error: Style::new().red().bold(),
            warn: Style::new().yellow().bold(),
            info: Style::new().magenta(),
            dim: Style::new().white().dimmed(),
            muted: Style::new().bright_black(),
            key: Style::new().blue().bold(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            success: Style::new(),
            error: Style::new(),
            warn: Style::new(),
            info: Style::new(),
            dim: Style::new(),
            muted: Style::new(),
            key: Style::new(),
        }
    }
}

impl Theme {
    /// Style for an object row outcome
    pub fn outcome(&self, outcome: RowOutcome) -> &Style {
        match outcome {
            RowOutcome::Inserted => &self.success,
            RowOutcome::Updated => &self.warn,
            RowOutcome::Unchanged => &self.muted,
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}
