use std::io::IsTerminal;

use comfy_table::{presets::NOTHING, Attribute, Cell, CellAlignment, Table};

use snapvault_core::manifest::ManifestName;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CliTableTheme {
    pub use_color: bool,
}

impl CliTableTheme {
    /// Bold headers only when stdout is a terminal and `NO_COLOR` is unset.
    pub(crate) fn detect() -> Self {
        Self::new(
            std::io::stdout().is_terminal(),
            std::env::var_os("NO_COLOR").is_some(),
        )
    }

    fn new(is_tty: bool, no_color: bool) -> Self {
        Self {
            use_color: is_tty && !no_color,
        }
    }

    fn label(self, text: &str) -> Cell {
        let cell = Cell::new(text);
        if self.use_color {
            cell.add_attribute(Attribute::Bold)
        } else {
            cell
        }
    }

    fn plain_table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }
}

/// One row per stored backup: where it sits in its chain and when it ran.
pub(crate) fn backups_table<'a>(
    theme: CliTableTheme,
    backups: impl IntoIterator<Item = &'a ManifestName>,
) -> Table {
    let mut table = theme.plain_table();
    let header: Vec<Cell> = ["Volume", "Snapshot", "From", "Started", "Job"]
        .iter()
        .map(|h| theme.label(h))
        .collect();
    table.set_header(header);
    for name in backups {
        table.add_row(vec![
            Cell::new(&name.volume),
            Cell::new(&name.snapshot),
            Cell::new(name.from_snapshot.as_deref().unwrap_or("(full)")),
            Cell::new(started_column(name)),
            Cell::new(name.job_id.as_str()),
        ]);
    }
    table
}

fn started_column(name: &ManifestName) -> String {
    name.job_id
        .started_at()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Two-column summary printed once a send or receive finishes. Labels are
/// right-aligned so the values line up.
pub(crate) fn summary_table(theme: CliTableTheme, rows: &[(&str, String)]) -> Table {
    let mut table = theme.plain_table();
    for (field, value) in rows {
        table.add_row(vec![
            theme.label(&format!("{field}:")).set_alignment(CellAlignment::Right),
            Cell::new(value),
        ]);
    }
    table
}
