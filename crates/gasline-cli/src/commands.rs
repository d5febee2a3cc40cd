//! Line commands read from stdin.

use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use gasline_core::sync::{CatalogView, SyncStatus};

pub const HELP: &str = "\
Commands:
  focus            screen focus (resync)
  foreground       app returned to foreground (resync)
  refresh [id]     pull-to-refresh, optionally only for agency <id>
  select <id>      switch the selected agency
  logout           drop all cached data
  status           print the current catalog
  quit             exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Focus,
    Foreground,
    Refresh(Option<String>),
    Select(String),
    Logout,
    Status,
    Help,
    Quit,
}

impl FromStr for CliCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else {
            bail!("empty command");
        };
        let arg = parts.next().map(str::to_string);
        if parts.next().is_some() {
            bail!("too many arguments for '{}'", word);
        }

        let command = match (word.to_lowercase().as_str(), arg) {
            ("focus", None) => CliCommand::Focus,
            ("foreground", None) => CliCommand::Foreground,
            ("refresh", arg) => CliCommand::Refresh(arg),
            ("select", Some(id)) => CliCommand::Select(id),
            ("select", None) => bail!("usage: select <agency-id>"),
            ("logout", None) => CliCommand::Logout,
            ("status", None) => CliCommand::Status,
            ("help" | "?", None) => CliCommand::Help,
            ("quit" | "exit" | "q", None) => CliCommand::Quit,
            (other, _) => return Err(anyhow!("unknown command '{}' (try 'help')", other)),
        };
        Ok(command)
    }
}

/// Multi-line summary of a view for the `status` command.
pub fn describe(view: &CatalogView) -> String {
    let mut out = String::new();
    let status = match &view.status {
        SyncStatus::Loading => "loading".to_string(),
        SyncStatus::Fresh => "fresh".to_string(),
        SyncStatus::Stale { error, .. } => format!("stale ({})", error),
        SyncStatus::AuthRequired => "session expired".to_string(),
        SyncStatus::SignedOut => "signed out".to_string(),
    };
    let _ = writeln!(
        out,
        "status: {}{} | push: {} | updated {}",
        status,
        if view.refreshing { ", refreshing" } else { "" },
        if view.connected { "connected" } else { "offline" },
        view.last_updated_display(),
    );

    let _ = writeln!(out, "agencies ({}):", view.agencies.len());
    for agency in &view.agencies {
        let marker = if view.selected_agency.as_deref() == Some(agency.id.as_str()) {
            '*'
        } else {
            ' '
        };
        let _ = writeln!(out, " {} {}  {}", marker, agency.id, agency.name);
    }

    match &view.selected_agency {
        Some(id) => {
            let _ = writeln!(out, "products for {} ({}):", id, view.products.len());
            for product in &view.products {
                let price = product
                    .effective_price()
                    .map(|p| format!("{:.2}", p))
                    .unwrap_or_else(|| "-".to_string());
                let stock = if product.in_stock() { "" } else { "  (out of stock)" };
                let _ = writeln!(out, "   {}  {}  {}{}", product.id, product.name, price, stock);
            }
        }
        None => {
            let _ = writeln!(out, "no agency selected");
        }
    }
    out
}
