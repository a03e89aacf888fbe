//! Rendering of search responses for the terminal.
//!
//! - JSON: the response exactly as the wire type serializes it
//! - Markdown: headed sections with a metadata table per result
//! - Plain text: copy-paste friendly listing

use clap::ValueEnum;

use crate::model::{Entity, EntityKind};
use crate::schema::SchemaRegistry;
use crate::search::SearchResponse;
use crate::search::facets::FacetResult;
use crate::search::query::SearchHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportFormat {
    #[default]
    Json,
    Markdown,
    #[value(name = "plain")]
    PlainText,
}

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Render facet counts after the results.
    pub include_facets: bool,
    /// Sessions listed per result (0 = all).
    pub max_sessions: usize,
    /// Free-text query, echoed in the header.
    pub query: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_facets: true,
            max_sessions: 5,
            query: None,
        }
    }
}

pub fn export_response(
    schema: &SchemaRegistry,
    response: &SearchResponse,
    format: ExportFormat,
    options: &ExportOptions,
) -> String {
    match format {
        ExportFormat::Json => {
            serde_json::to_string_pretty(response).unwrap_or_else(|_| "{}".to_string())
        }
        ExportFormat::Markdown => export_markdown(schema, response, options),
        ExportFormat::PlainText => export_plain_text(schema, response, options),
    }
}

/// Escape special Markdown characters to prevent formatting issues or injection.
fn escape_markdown(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('|', "\\|")
        .replace('*', "\\*")
        .replace('_', "\\_")
        .replace('[', "\\[")
        .replace(']', "\\]")
        .replace('<', "\\<")
        .replace('>', "\\>")
        .replace('`', "\\`")
}

fn title(schema: &SchemaRegistry, entity: &Entity) -> String {
    schema
        .title_field(entity.kind)
        .and_then(|f| entity.get(f))
        .map(|v| v.display())
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("{} {}", entity.kind, entity.id))
}

fn session_line(schema: &SchemaRegistry, session: &Entity) -> String {
    let start = schema
        .session_start_field()
        .and_then(|f| session.get(f))
        .and_then(|v| v.as_date())
        .map(|d| d.format("%Y-%m-%d").to_string());
    match start {
        Some(start) => format!("{} ({start})", title(schema, session)),
        None => title(schema, session),
    }
}

fn summary_line(response: &SearchResponse) -> String {
    format!(
        "Results: {} | Page {} of {} | {} ms",
        response.total_count,
        response.page,
        response.total_pages.max(1),
        response.search_duration_ms
    )
}

fn visible_sessions<'a>(hit: &'a SearchHit, options: &ExportOptions) -> &'a [Entity] {
    if options.max_sessions == 0 || hit.sessions.len() <= options.max_sessions {
        &hit.sessions
    } else {
        &hit.sessions[..options.max_sessions]
    }
}

fn export_markdown(schema: &SchemaRegistry, response: &SearchResponse, options: &ExportOptions) -> String {
    let mut output = String::new();
    output.push_str("# Search Results\n\n");

    if let Some(query) = &options.query {
        output.push_str(&format!("**Query:** `{}`\n\n", query.replace('`', "")));
    }
    for filter in &response.applied_filters {
        output.push_str(&format!(
            "- **{}** {} `{}`\n",
            escape_markdown(&filter.label),
            filter.operator,
            filter.value.to_string().replace('`', "")
        ));
    }
    if !response.applied_filters.is_empty() {
        output.push('\n');
    }
    output.push_str(&format!("**{}**\n\n---\n\n", summary_line(response)));

    let offset = response.page.saturating_sub(1) * response.page_size;
    for (i, hit) in response.results.iter().enumerate() {
        output.push_str(&format!(
            "## {}. {}\n\n",
            offset + i + 1,
            escape_markdown(&title(schema, &hit.program))
        ));

        output.push_str("| Field | Value |\n");
        output.push_str("|-------|-------|\n");
        output.push_str(&format!("| Program | `{}` |\n", hit.program.id.replace('`', "")));
        if let Some(kind) = &hit.program.discriminator {
            output.push_str(&format!("| Type | {} |\n", escape_markdown(kind)));
        }
        if let Some(partner) = &hit.partner {
            output.push_str(&format!("| Partner | {} |\n", escape_markdown(&title(schema, partner))));
        }
        output.push_str(&format!(
            "| Sessions | {} of {} |\n",
            hit.matching_session_count, hit.total_session_count
        ));
        if let Some(next) = hit.next_start {
            output.push_str(&format!("| Next start | {} |\n", next.format("%Y-%m-%d")));
        }
        if let Some(score) = hit.score {
            output.push_str(&format!("| Score | {score:.2} |\n"));
        }
        output.push('\n');

        let sessions = visible_sessions(hit, options);
        for session in sessions {
            output.push_str(&format!("- {}\n", escape_markdown(&session_line(schema, session))));
        }
        if sessions.len() < hit.sessions.len() {
            output.push_str(&format!("- _and {} more_\n", hit.sessions.len() - sessions.len()));
        }
        if !sessions.is_empty() {
            output.push('\n');
        }
        output.push_str("---\n\n");
    }

    if options.include_facets && !response.facets.is_empty() {
        output.push_str("## Facets\n\n");
        for facet in &response.facets {
            output.push_str(&format!("### {}\n\n", escape_markdown(&facet_heading(facet))));
            for value in &facet.values {
                let mark = if value.selected { "[x]" } else { "[ ]" };
                output.push_str(&format!(
                    "- {mark} {} ({})\n",
                    escape_markdown(&value.label),
                    value.count
                ));
            }
            output.push('\n');
        }
    }

    output
}

fn export_plain_text(schema: &SchemaRegistry, response: &SearchResponse, options: &ExportOptions) -> String {
    let mut output = String::new();
    output.push_str("SEARCH RESULTS\n");
    output.push_str(&"=".repeat(60));
    output.push('\n');

    if let Some(query) = &options.query {
        output.push_str(&format!("Query: {query}\n"));
    }
    for filter in &response.applied_filters {
        output.push_str(&format!("Filter: {} {} {}\n", filter.label, filter.operator, filter.value));
    }
    output.push_str(&summary_line(response));
    output.push('\n');
    output.push_str(&"=".repeat(60));
    output.push_str("\n\n");

    let offset = response.page.saturating_sub(1) * response.page_size;
    for (i, hit) in response.results.iter().enumerate() {
        output.push_str(&format!("[{}] {}\n", offset + i + 1, title(schema, &hit.program)));
        output.push_str(&"-".repeat(60));
        output.push('\n');
        if let Some(partner) = &hit.partner {
            output.push_str(&format!("Partner: {}\n", title(schema, partner)));
        }
        output.push_str(&format!(
            "Sessions: {} of {}\n",
            hit.matching_session_count, hit.total_session_count
        ));
        if let Some(next) = hit.next_start {
            output.push_str(&format!("Next start: {}\n", next.format("%Y-%m-%d")));
        }
        if let Some(score) = hit.score {
            output.push_str(&format!("Score: {score:.2}\n"));
        }
        for session in visible_sessions(hit, options) {
            output.push_str(&format!("  * {}\n", session_line(schema, session)));
        }
        output.push('\n');
    }

    if options.include_facets {
        for facet in response.facets.iter().filter(|f| !f.values.is_empty()) {
            let values: Vec<String> = facet
                .values
                .iter()
                .map(|v| {
                    let star = if v.selected { "*" } else { "" };
                    format!("{star}{} ({})", v.label, v.count)
                })
                .collect();
            output.push_str(&format!("{}: {}\n", facet_heading(facet), values.join(", ")));
        }
    }

    output
}

fn facet_heading(facet: &FacetResult) -> String {
    match facet.entity {
        EntityKind::Program => facet.label.clone(),
        other => format!("{} {}", other, facet.label),
    }
}
