use std::{sync::Arc, time::SystemTime};

use anyhow::Result;
use bpf_common::Pid;
use chrono::{DateTime, SecondsFormat, Utc};
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use process_resolver::ProcessResolverEntry;

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

/// Outcome of resolving one pid.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub pid: Pid,
    pub entry: Option<Arc<ProcessResolverEntry>>,
}

impl TermPrintable for Vec<Resolution> {
    fn term_print(&self) -> Result<TermPrinted> {
        println!("{}", resolution_table(self));
        Ok(TermPrinted)
    }
}

fn resolution_table(resolutions: &[Resolution]) -> Table {
    let mut table = table();

    table.set_header(vec![
        Cell::new("PID").add_attribute(Attribute::Bold),
        Cell::new("PATH").add_attribute(Attribute::Bold),
        Cell::new("STARTED").add_attribute(Attribute::Bold),
    ]);

    for resolution in resolutions {
        let pid = Cell::new(resolution.pid).fg(Color::Cyan);
        let row = match &resolution.entry {
            Some(entry) => vec![
                pid,
                Cell::new(&entry.pathname),
                Cell::new(entry.timestamp.map(rfc3339).unwrap_or_else(|| "-".to_string())),
            ],
            None => vec![
                pid,
                Cell::new("unresolved").fg(Color::Red),
                Cell::new("-"),
            ],
        };
        table.add_row(row);
    }

    table
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
