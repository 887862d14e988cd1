//! Assembly of the ordered locator list from arguments, environment, or stdin.

use std::io::{self, IsTerminal, Read};

use anyhow::{Context, Result};

pub(crate) const ENV_LOCATORS: &str = "MEDIARELAY_LOCATORS";

/// Positional arguments win, then `MEDIARELAY_LOCATORS` (comma-separated),
/// then stdin lines when stdin is piped. Order is preserved and blank
/// entries are dropped; duplicates are kept.
pub(crate) fn collect_locators(
    positional: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<String>> {
    if !positional.is_empty() {
        return Ok(clean(positional.iter().map(String::as_str)));
    }
    if let Some(raw) = lookup(ENV_LOCATORS)
        && !raw.trim().is_empty()
    {
        return Ok(clean(raw.split(',')));
    }
    if io::stdin().is_terminal() {
        return Ok(Vec::new());
    }
    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read locators from stdin")?;
    Ok(parse_locator_lines(&buffer))
}

/// One locator per line; `#` starts a comment line.
pub(crate) fn parse_locator_lines(text: &str) -> Vec<String> {
    clean(text.lines().filter(|line| !line.trim_start().starts_with('#')))
}

fn clean<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    items
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}
