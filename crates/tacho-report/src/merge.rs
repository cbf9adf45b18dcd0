//! Idempotent merge of one report into a record body.
//!
//! The merge is the only thing standing between a rare double write and a
//! corrupted record, so it must tolerate every interleaving the lock
//! negotiation lets through:
//! - **Idempotent**: merging the same report twice yields the same body
//! - **Commutative** for reports with different ids
//! - **Run monotonic**: a section's run number never decreases, so a stale
//!   job cannot overwrite fresher data
//!
//! Ordering depends only on sort keys, never on arrival order.

use tacho_core::error::Result;
use tacho_core::id::MeasurementId;

use crate::document::{
    ArchivedRun, Document, Section, Status, SummaryGroup, results_id, summary_item_id,
};
use crate::report::Report;

/// Merge behavior toggles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Archive the previous content of a result section replaced by a newer run.
    pub keep_old_results: bool,
    /// Initial `open` state of newly inserted result sections.
    pub default_open: bool,
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Sections inserted.
    pub inserted: usize,
    /// Sections whose content was replaced.
    pub updated: usize,
    /// Sections whose status and run were refreshed by a running report.
    pub status_only: usize,
    /// Sections left untouched because they already hold a newer run.
    pub stale: usize,
    /// Placeholder summaries removed once real measurements arrived.
    pub rehomed: usize,
}

impl MergeOutcome {
    /// Returns true if every section the report touched was stale.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale > 0 && self.inserted == 0 && self.updated == 0 && self.status_only == 0
    }

    fn record(&mut self, change: Change) {
        match change {
            Change::Inserted => self.inserted += 1,
            Change::Updated => self.updated += 1,
            Change::StatusOnly => self.status_only += 1,
            Change::Stale => self.stale += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Inserted,
    Updated,
    StatusOnly,
    Stale,
}

/// Merges a report into the previous body (or a fresh skeleton).
///
/// The previous body may still carry a lock marker; it is ignored. The
/// returned body never carries one.
///
/// # Errors
///
/// Returns [`tacho_core::Error::InvalidInput`] if the report fails validation.
pub fn merge(
    previous: Option<&str>,
    report: &Report,
    options: &MergeOptions,
) -> Result<(String, MergeOutcome)> {
    let mut doc = previous.map_or_else(Document::skeleton, Document::parse);
    let outcome = merge_document(&mut doc, report, options)?;
    Ok((doc.render(), outcome))
}

/// Merges a report into a parsed document in place.
///
/// # Errors
///
/// Returns [`tacho_core::Error::InvalidInput`] if the report fails validation.
pub fn merge_document(
    doc: &mut Document,
    report: &Report,
    options: &MergeOptions,
) -> Result<MergeOutcome> {
    report.validate()?;
    let mut outcome = MergeOutcome::default();

    if !report.running {
        doc.pending = false;
    }

    if report.has_known_measurements() {
        outcome.rehomed = remove_placeholders(doc, report);
    }

    let status = if report.running {
        Status::Running
    } else {
        Status::Complete
    };

    for summary in &report.summaries {
        let group = group_mut(doc, &summary.measurement_id, &summary.measurement_name);
        let candidate = Section {
            id: summary_item_id(&summary.measurement_id, &report.id),
            run_number: report.run_number,
            title: report.title.clone(),
            job_index: report.job_index,
            status,
            open: false,
            content: summary.markup.clone(),
            archived: Vec::new(),
        };
        outcome.record(upsert(&mut group.items, candidate, false));
    }

    let candidate = Section {
        id: results_id(&report.id),
        run_number: report.run_number,
        title: report.title.clone(),
        job_index: report.job_index,
        status,
        open: options.default_open,
        content: report.body.clone(),
        archived: Vec::new(),
    };
    outcome.record(upsert(&mut doc.results, candidate, options.keep_old_results));

    tracing::debug!(
        report_id = %report.id,
        run_number = report.run_number,
        inserted = outcome.inserted,
        updated = outcome.updated,
        status_only = outcome.status_only,
        stale = outcome.stale,
        rehomed = outcome.rehomed,
        "merged report"
    );
    Ok(outcome)
}

fn remove_placeholders(doc: &mut Document, report: &Report) -> usize {
    let unknown = MeasurementId::unknown();
    let placeholder = summary_item_id(&unknown, &report.id);
    let Some(index) = doc
        .summaries
        .iter()
        .position(|g| g.measurement_id == unknown.as_str())
    else {
        return 0;
    };

    let group = &mut doc.summaries[index];
    let before = group.items.len();
    group
        .items
        .retain(|item| item.id != placeholder || item.run_number > report.run_number);
    let removed = before - group.items.len();
    if group.items.is_empty() {
        doc.summaries.remove(index);
    }
    removed
}

fn group_mut<'a>(
    doc: &'a mut Document,
    measurement_id: &MeasurementId,
    name: &str,
) -> &'a mut SummaryGroup {
    let index = match doc
        .summaries
        .iter()
        .position(|g| g.measurement_id == measurement_id.as_str())
    {
        Some(index) => index,
        None => {
            let group = SummaryGroup {
                measurement_id: measurement_id.to_string(),
                name: name.to_string(),
                items: Vec::new(),
            };
            let index = doc
                .summaries
                .iter()
                .position(|g| g.sort_key() > group.sort_key())
                .unwrap_or(doc.summaries.len());
            doc.summaries.insert(index, group);
            index
        }
    };
    &mut doc.summaries[index]
}

fn upsert(list: &mut Vec<Section>, candidate: Section, keep_old: bool) -> Change {
    let Some(index) = list.iter().position(|s| s.id == candidate.id) else {
        insert_ordered(list, candidate);
        return Change::Inserted;
    };

    let existing = &mut list[index];
    if existing.run_number > candidate.run_number {
        return Change::Stale;
    }

    if candidate.status == Status::Running {
        existing.status = Status::Running;
        existing.run_number = candidate.run_number;
        return Change::StatusOnly;
    }

    let mut replaced = list.remove(index);
    if keep_old
        && replaced.run_number < candidate.run_number
        && replaced.status == Status::Complete
        && !replaced
            .archived
            .iter()
            .any(|a| a.run_number == replaced.run_number)
    {
        replaced.archived.insert(
            0,
            ArchivedRun {
                run_number: replaced.run_number,
                content: std::mem::take(&mut replaced.content),
            },
        );
    }

    let updated = Section {
        open: replaced.open,
        archived: replaced.archived,
        ..candidate
    };
    insert_ordered(list, updated);
    Change::Updated
}

fn insert_ordered(list: &mut Vec<Section>, section: Section) {
    let index = list
        .iter()
        .position(|s| s.sort_key() > section.sort_key())
        .unwrap_or(list.len());
    list.insert(index, section);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tacho_core::id::ReportId;

    fn report(id: &str, title: &str, run: u64) -> Report {
        Report::new(ReportId::new(id).expect("id"), title, run).with_body(format!("{title}@{run}"))
    }

    fn mid(s: &str) -> MeasurementId {
        MeasurementId::try_from(s.to_string()).expect("mid")
    }

    fn apply(body: Option<&str>, r: &Report) -> String {
        merge(body, r, &MergeOptions::default()).expect("merge").0
    }

    #[test]
    fn merge_into_nothing_creates_section_and_clears_pending() {
        let (body, outcome) = merge(None, &report("a", "A", 1), &MergeOptions::default())
            .expect("merge");
        let doc = Document::parse(&body);
        assert!(!doc.pending);
        assert_eq!(doc.results.len(), 1);
        assert_eq!(doc.results[0].content, "A@1");
        assert_eq!(outcome.inserted, 1);
    }

    #[test]
    fn running_report_keeps_pending() {
        let body = apply(None, &report("a", "A", 1).running(true));
        let doc = Document::parse(&body);
        assert!(doc.pending);
        assert_eq!(doc.results[0].status, Status::Running);
    }

    #[test]
    fn sections_are_ordered_by_title_then_job_index() {
        let mut body = apply(None, &report("z", "Beta", 1));
        body = apply(Some(&body), &report("y", "Alpha", 1).with_job_index(2));
        body = apply(Some(&body), &report("x", "Alpha", 1).with_job_index(1));
        let titles: Vec<_> = Document::parse(&body)
            .results
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(titles, ["results::x", "results::y", "results::z"]);
    }

    #[test]
    fn older_run_is_stale() {
        let body = apply(None, &report("a", "A", 5));
        let (next, outcome) =
            merge(Some(&body), &report("a", "A", 4), &MergeOptions::default()).expect("merge");
        assert_eq!(next, body);
        assert!(outcome.is_stale());
    }

    #[test]
    fn running_report_only_touches_status_and_run() {
        let body = apply(None, &report("a", "A", 5));
        let next = apply(
            Some(&body),
            &report("a", "Renamed", 6).running(true).with_body("partial"),
        );
        let section = Document::parse(&next).results.remove(0);
        assert_eq!(section.status, Status::Running);
        assert_eq!(section.run_number, 6);
        assert_eq!(section.title, "A");
        assert_eq!(section.content, "A@5");
    }

    #[test]
    fn equal_run_running_publish_only_flips_status() {
        let body = apply(None, &report("a", "A", 5));
        let (next, outcome) = merge(
            Some(&body),
            &report("a", "A", 5).running(true).with_body("partial"),
            &MergeOptions::default(),
        )
        .expect("merge");

        assert_eq!(outcome.status_only, 1);
        assert_eq!(outcome.stale, 0);
        let section = Document::parse(&next).results.remove(0);
        assert_eq!(section.status, Status::Running);
        assert_eq!(section.run_number, 5);
        assert_eq!(section.content, "A@5");
    }

    #[test]
    fn keep_old_results_archives_previous_run() {
        let options = MergeOptions {
            keep_old_results: true,
            default_open: true,
        };
        let (body, _) = merge(None, &report("a", "A", 1), &options).expect("merge");
        let (body, _) = merge(Some(&body), &report("a", "A", 2), &options).expect("merge");
        let (again, _) = merge(Some(&body), &report("a", "A", 2), &options).expect("merge");
        assert_eq!(body, again);

        let section = Document::parse(&body).results.remove(0);
        assert!(section.open);
        assert_eq!(section.content, "A@2");
        assert_eq!(
            section.archived,
            vec![ArchivedRun {
                run_number: 1,
                content: "A@1".into()
            }]
        );
    }

    #[test]
    fn replace_in_place_by_default() {
        let body = apply(None, &report("a", "A", 1));
        let body = apply(Some(&body), &report("a", "A", 2));
        let section = Document::parse(&body).results.remove(0);
        assert!(section.archived.is_empty());
        assert!(!section.open);
    }

    #[test]
    fn existing_sections_keep_open_state() {
        let open = MergeOptions {
            default_open: true,
            ..MergeOptions::default()
        };
        let (body, _) = merge(None, &report("a", "A", 1), &open).expect("merge");
        let body = apply(Some(&body), &report("a", "A", 2));
        assert!(Document::parse(&body).results[0].open);
    }

    #[test]
    fn real_measurements_replace_placeholder() {
        let running = report("a", "A", 3)
            .running(true)
            .with_summary(MeasurementId::unknown(), "unknown", "waiting");
        let body = apply(None, &running);
        assert!(Document::parse(&body).group("unknown").is_some());

        let done = report("a", "A", 3).with_summary(mid("fcp1"), "first-contentful-paint", "1.2s");
        let (body, outcome) = merge(Some(&body), &done, &MergeOptions::default()).expect("merge");
        let doc = Document::parse(&body);
        assert_eq!(outcome.rehomed, 1);
        assert!(doc.group("unknown").is_none());
        assert_eq!(doc.group("fcp1").expect("group").items[0].content, "1.2s");
    }

    #[test]
    fn newer_placeholder_survives_older_measurements() {
        let running = report("a", "A", 4)
            .running(true)
            .with_summary(MeasurementId::unknown(), "unknown", "waiting");
        let body = apply(None, &running);
        let old = report("a", "A", 3).with_summary(mid("m"), "m", "x");
        let doc = Document::parse(&apply(Some(&body), &old));
        assert_eq!(doc.group("unknown").expect("placeholder").items.len(), 1);
    }

    #[test]
    fn groups_are_ordered_by_name() {
        let r = report("a", "A", 1)
            .with_summary(mid("m2"), "zeta", "z")
            .with_summary(mid("m1"), "alpha", "a");
        let doc = Document::parse(&apply(None, &r));
        let names: Vec<_> = doc.summaries.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["alpha", "zeta"]);
    }

    #[test]
    fn lock_marker_is_dropped_from_output() {
        let body = format!(
            "<!-- tacho:lock holder=\"01H\" /-->\n{}",
            Document::skeleton().render()
        );
        let next = apply(Some(&body), &report("a", "A", 1));
        assert!(!next.contains("tacho:lock"));
    }

    #[test]
    fn invalid_report_is_rejected() {
        let bad = report("a", "A", 1).with_body("<!-- tacho:section -->");
        assert!(merge(None, &bad, &MergeOptions::default()).is_err());
    }
}
