//! Structured view of a record body.
//!
//! A body is parsed into a [`Document`] by reading its fences; everything
//! outside fences is decoration and is regenerated by [`Document::render`].
//! Rendering is canonical: `Document::parse(&doc.render()) == doc` for every
//! document built from valid reports.

use std::fmt::Write as _;

use tacho_core::id::{MeasurementId, ReportId};
use tacho_core::markup::{self, Element, Node, close_fence, escape_attr, open_fence};

/// Footer carried exactly once by every body this system writes.
pub const IDENTITY_MARKER: &str = "<!-- tacho:identity /-->";

const HEADING: &str = "<h2>📊 Benchmark results</h2>";
const PENDING_NOTICE: &str = "<p>⏳ Benchmarks are still running…</p>";
const FOOTER: &str = "<sub>Updated automatically by tacho. Edits to this comment are overwritten.</sub>";

const PENDING: &str = "pending";
const SUMMARIES: &str = "summaries";
const GROUP: &str = "group";
const ITEM: &str = "item";
const RESULTS: &str = "results";
const SECTION: &str = "section";
const CONTENT: &str = "content";
const ARCHIVE: &str = "archive";

/// Returns the id of a report's result section.
#[must_use]
pub fn results_id(report: &ReportId) -> String {
    format!("results::{report}")
}

/// Returns the id of a measurement's summary group.
#[must_use]
pub fn summary_group_id(measurement: &MeasurementId) -> String {
    format!("summary::{measurement}")
}

/// Returns the id of a report's summary item within a measurement group.
#[must_use]
pub fn summary_item_id(measurement: &MeasurementId, report: &ReportId) -> String {
    format!("summary::{measurement}::{report}")
}

/// Progress of the job behind a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Benchmarks still running.
    Running,
    /// Final results.
    Complete,
}

impl Status {
    /// Returns the attribute value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }

    /// Parses an attribute value; anything unrecognized is `Complete`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "running" {
            Self::Running
        } else {
            Self::Complete
        }
    }

    fn icon(self) -> &'static str {
        match self {
            Self::Running => "⏱️",
            Self::Complete => "✅",
        }
    }
}

/// Content of an earlier run kept under a result section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedRun {
    /// Run that produced the content.
    pub run_number: u64,
    /// Rendered content of that run.
    pub content: String,
}

/// An addressable region of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// `results::<report>` or `summary::<measurement>::<report>`.
    pub id: String,
    /// Run that last wrote the section. Never decreases.
    pub run_number: u64,
    /// Primary sort key.
    pub title: String,
    /// Secondary sort key.
    pub job_index: u32,
    /// Job progress.
    pub status: Status,
    /// Whether the section renders expanded. Result sections only.
    pub open: bool,
    /// Rendered fragment.
    pub content: String,
    /// Earlier runs, newest first. Result sections only.
    pub archived: Vec<ArchivedRun>,
}

impl Section {
    /// Ordering key: title, then job index, then id.
    #[must_use]
    pub fn sort_key(&self) -> (&str, u32, &str) {
        (&self.title, self.job_index, &self.id)
    }

    fn from_element(el: &Element) -> Option<Self> {
        let id = el.attr("id")?.to_string();
        Some(Self {
            id,
            run_number: el.attr("run").and_then(|v| v.parse().ok()).unwrap_or(0),
            title: el.attr("title").unwrap_or_default().to_string(),
            job_index: el.attr("job").and_then(|v| v.parse().ok()).unwrap_or(0),
            status: el.attr("status").map_or(Status::Complete, Status::parse),
            open: el.attr("open") == Some("true"),
            content: el
                .children_named(CONTENT)
                .next()
                .map(content_text)
                .unwrap_or_default(),
            archived: el
                .children_named(ARCHIVE)
                .map(|archive| ArchivedRun {
                    run_number: archive
                        .attr("run")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    content: archive
                        .children_named(CONTENT)
                        .next()
                        .map(content_text)
                        .unwrap_or_default(),
                })
                .collect(),
        })
    }

    fn attrs(&self) -> (String, String) {
        (self.run_number.to_string(), self.job_index.to_string())
    }
}

/// Summaries for one measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryGroup {
    /// Measurement id (the group id without its `summary::` prefix).
    pub measurement_id: String,
    /// Measurement display name; primary sort key.
    pub name: String,
    /// One item per report, ordered by [`Section::sort_key`].
    pub items: Vec<Section>,
}

impl SummaryGroup {
    /// Ordering key: name, then measurement id.
    #[must_use]
    pub fn sort_key(&self) -> (&str, &str) {
        (&self.name, &self.measurement_id)
    }
}

/// Parsed record body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Whether the "still running" placeholder is shown.
    pub pending: bool,
    /// Summary groups, ordered by [`SummaryGroup::sort_key`].
    pub summaries: Vec<SummaryGroup>,
    /// Result sections, ordered by [`Section::sort_key`].
    pub results: Vec<Section>,
}

impl Document {
    /// Returns the body of a freshly created record.
    #[must_use]
    pub fn skeleton() -> Self {
        Self {
            pending: true,
            summaries: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Parses a body. Unrecognized or malformed content is dropped.
    ///
    /// Duplicate section ids (left behind by a rare double write) collapse to
    /// the copy with the highest run, and everything comes back in canonical
    /// order.
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let nodes = markup::parse(body);
        let mut doc = Self {
            pending: markup::find(&nodes, PENDING).is_some(),
            summaries: Vec::new(),
            results: Vec::new(),
        };

        for summaries in find_all(&nodes, SUMMARIES) {
            for group_el in summaries.children_named(GROUP) {
                let Some(measurement_id) = group_el
                    .attr("id")
                    .and_then(|id| id.strip_prefix("summary::"))
                else {
                    tracing::debug!("skipping summary group without id");
                    continue;
                };
                let mut group = SummaryGroup {
                    measurement_id: measurement_id.to_string(),
                    name: group_el.attr("name").unwrap_or(measurement_id).to_string(),
                    items: Vec::new(),
                };
                for item in group_el.children_named(ITEM).filter_map(Section::from_element) {
                    push_unique(&mut group.items, item);
                }
                match doc
                    .summaries
                    .iter_mut()
                    .find(|g| g.measurement_id == group.measurement_id)
                {
                    Some(existing) => {
                        for item in group.items {
                            push_unique(&mut existing.items, item);
                        }
                    }
                    None => doc.summaries.push(group),
                }
            }
        }

        for results in find_all(&nodes, RESULTS) {
            for section in results.children_named(SECTION).filter_map(Section::from_element) {
                push_unique(&mut doc.results, section);
            }
        }

        doc.sort();
        doc
    }

    /// Restores canonical ordering of groups, items and sections.
    pub fn sort(&mut self) {
        self.summaries.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for group in &mut self.summaries {
            group.items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        }
        self.results.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    /// Renders the canonical body, ending with the identity marker.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(HEADING);
        out.push('\n');

        if self.pending {
            let _ = writeln!(
                out,
                "{}\n{PENDING_NOTICE}\n{}",
                open_fence(PENDING, &[]),
                close_fence(PENDING)
            );
        }

        let _ = writeln!(out, "{}", open_fence(SUMMARIES, &[]));
        for group in &self.summaries {
            render_group(&mut out, group);
        }
        let _ = writeln!(out, "{}", close_fence(SUMMARIES));

        let _ = writeln!(out, "{}", open_fence(RESULTS, &[]));
        for section in &self.results {
            render_section(&mut out, section);
        }
        let _ = writeln!(out, "{}", close_fence(RESULTS));

        out.push_str(FOOTER);
        out.push('\n');
        out.push_str(IDENTITY_MARKER);
        out
    }

    /// Looks up a result section.
    #[must_use]
    pub fn result(&self, id: &str) -> Option<&Section> {
        self.results.iter().find(|s| s.id == id)
    }

    /// Looks up a summary group by measurement id.
    #[must_use]
    pub fn group(&self, measurement_id: &str) -> Option<&SummaryGroup> {
        self.summaries
            .iter()
            .find(|g| g.measurement_id == measurement_id)
    }
}

fn find_all<'a>(nodes: &'a [Node], name: &str) -> Vec<&'a Element> {
    let mut found = Vec::new();
    for node in nodes {
        if let Node::Element(el) = node {
            if el.name == name {
                found.push(el);
            } else {
                found.extend(find_all(&el.children, name));
            }
        }
    }
    found
}

fn push_unique(list: &mut Vec<Section>, section: Section) {
    match list.iter_mut().find(|s| s.id == section.id) {
        Some(existing) if existing.run_number < section.run_number => *existing = section,
        Some(_) => {}
        None => list.push(section),
    }
}

fn content_text(el: &Element) -> String {
    let text = el.text();
    let text = text.strip_prefix('\n').unwrap_or(&text);
    text.strip_suffix('\n').unwrap_or(text).to_string()
}

fn render_content(out: &mut String, content: &str) {
    let _ = writeln!(
        out,
        "{}\n{content}\n{}",
        open_fence(CONTENT, &[]),
        close_fence(CONTENT)
    );
}

fn render_group(out: &mut String, group: &SummaryGroup) {
    let id = format!("summary::{}", group.measurement_id);
    let _ = writeln!(
        out,
        "{}\n<h3>{}</h3>",
        open_fence(GROUP, &[("id", &id), ("name", &group.name)]),
        escape_attr(&group.name)
    );
    for item in &group.items {
        let (run, job) = item.attrs();
        let _ = writeln!(
            out,
            "{}\n{} <b>{}</b>",
            open_fence(
                ITEM,
                &[
                    ("id", &item.id),
                    ("run", &run),
                    ("title", &item.title),
                    ("job", &job),
                    ("status", item.status.as_str()),
                ]
            ),
            item.status.icon(),
            escape_attr(&item.title)
        );
        render_content(out, &item.content);
        let _ = writeln!(out, "{}", close_fence(ITEM));
    }
    let _ = writeln!(out, "{}", close_fence(GROUP));
}

fn render_section(out: &mut String, section: &Section) {
    let (run, job) = section.attrs();
    let open = if section.open { "true" } else { "false" };
    let _ = writeln!(
        out,
        "{}\n<details{}>\n<summary>{} {}</summary>\n",
        open_fence(
            SECTION,
            &[
                ("id", &section.id),
                ("run", &run),
                ("title", &section.title),
                ("job", &job),
                ("status", section.status.as_str()),
                ("open", open),
            ]
        ),
        if section.open { " open" } else { "" },
        section.status.icon(),
        escape_attr(&section.title)
    );
    render_content(out, &section.content);
    for archived in &section.archived {
        let run = archived.run_number.to_string();
        let _ = writeln!(
            out,
            "{}\n<details>\n<summary>Run #{run}</summary>\n",
            open_fence(ARCHIVE, &[("run", &run)])
        );
        render_content(out, &archived.content);
        let _ = writeln!(out, "</details>\n{}", close_fence(ARCHIVE));
    }
    let _ = writeln!(out, "</details>\n{}", close_fence(SECTION));
}

/// Returns true if the body carries the identity marker exactly once.
#[must_use]
pub fn has_single_identity(body: &str) -> bool {
    body.matches(IDENTITY_MARKER).count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(id: &str, title: &str, run: u64) -> Section {
        Section {
            id: id.into(),
            run_number: run,
            title: title.into(),
            job_index: 0,
            status: Status::Complete,
            open: false,
            content: format!("<p>{title} run {run}</p>"),
            archived: Vec::new(),
        }
    }

    #[test]
    fn skeleton_renders_pending_and_identity() {
        let body = Document::skeleton().render();
        assert!(body.contains("tacho:pending"));
        assert!(has_single_identity(&body));
        assert_eq!(Document::parse(&body), Document::skeleton());
    }

    #[test]
    fn render_parse_is_lossless() {
        let mut results = section("results::a", "Title \"quoted\" <x> & y", 3);
        results.open = true;
        results.status = Status::Running;
        results.archived.push(ArchivedRun {
            run_number: 2,
            content: "old\n\nmultiline".into(),
        });
        let doc = Document {
            pending: false,
            summaries: vec![SummaryGroup {
                measurement_id: "m1".into(),
                name: "first-contentful-paint".into(),
                items: vec![section("summary::m1::a", "A", 3)],
            }],
            results: vec![section("results::b", "B", 1), results],
        };

        let body = doc.render();
        assert_eq!(Document::parse(&body), doc);
        assert_eq!(Document::parse(&body).render(), body);
    }

    #[test]
    fn lock_marker_and_decoration_are_ignored() {
        let doc = Document {
            results: vec![section("results::a", "A", 1)],
            ..Document::skeleton()
        };
        let body = format!("<!-- tacho:lock holder=\"h\" /-->\n{}", doc.render());
        assert_eq!(Document::parse(&body), doc);
    }

    #[test]
    fn duplicate_sections_keep_highest_run() {
        let a = Document {
            results: vec![section("results::a", "A", 5)],
            ..Document::skeleton()
        };
        let b = Document {
            results: vec![section("results::a", "A", 4)],
            ..Document::skeleton()
        };
        let body = format!("{}\n{}", b.render(), a.render());
        let parsed = Document::parse(&body);
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].run_number, 5);
    }

    #[test]
    fn foreign_text_parses_to_empty_document() {
        let doc = Document::parse("just a human comment");
        assert!(!doc.pending);
        assert!(doc.results.is_empty());
        assert!(doc.summaries.is_empty());
    }

    #[test]
    fn empty_content_round_trips() {
        let doc = Document {
            results: vec![Section {
                content: String::new(),
                ..section("results::a", "A", 1)
            }],
            ..Document::skeleton()
        };
        assert_eq!(Document::parse(&doc.render()), doc);
    }
}
