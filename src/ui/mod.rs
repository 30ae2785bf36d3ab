pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{
    dim, error, header, info, muted, object_inserted, object_skipped, object_unchanged, object_updated,
    section, status, success, summary_row, timing, warn,
};
pub use table::{stats_table, structure_table, value_table, TableBuilder};
pub use theme::{theme, Theme};
