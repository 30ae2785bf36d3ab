use crate::storage::RowOutcome;
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::ROCKET, text.style(theme().header.clone()));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, label.style(theme().dim.clone()), value);
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().success.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().error.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().warn.clone()));
}

pub fn info(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        Icons::INFO.style(theme().info.clone()),
        label.style(theme().dim.clone()),
        value
    );
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(theme().header.clone()));
}

pub fn dim(text: &str) -> String {
    text.style(theme().dim.clone()).to_string()
}

pub fn muted(text: &str) -> String {
    text.style(theme().muted.clone()).to_string()
}

fn object_line(icon: &str, outcome: RowOutcome, scheme: &str, id: i64) {
    let style = theme().outcome(outcome).clone();
    println!(
        "{} {} {}",
        icon.style(style),
        scheme,
        format!("#{}", id).style(theme().key.clone())
    );
}

pub fn object_inserted(scheme: &str, id: i64) {
    object_line(Icons::NEW, RowOutcome::Inserted, scheme, id);
}

pub fn object_updated(scheme: &str, id: i64) {
    object_line(Icons::MOD, RowOutcome::Updated, scheme, id);
}

pub fn object_unchanged(scheme: &str, id: i64) {
    println!("  {} {}", scheme.style(theme().muted.clone()), muted(&format!("#{}", id)));
}

pub fn object_skipped(id: i64, reason: &str) {
    eprintln!(
        "{} {} {}",
        Icons::SKIP.style(theme().warn.clone()),
        format!("#{}", id).style(theme().key.clone()),
        reason.style(theme().dim.clone())
    );
}

pub fn timing(elapsed: &str) {
    println!("{} {}", Icons::CLOCK.style(theme().dim.clone()), elapsed);
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().dim.clone()), value);
}
