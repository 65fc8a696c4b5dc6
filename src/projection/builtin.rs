//! Views of the Charon LIMS document model: projects, samples, library
//! preparations, sequencing runs and users.
//!
//! Each view is a [`DoctypeRouter`] with one strategy per doctype it reads.

use super::{DoctypeRouter, EmissionBuffer, ProjectionResult};
use crate::core::{Document, Value};
use crate::reduce::ReduceSpec;
use crate::view::ViewDefinition;

pub const PROJECT: &str = "project";
pub const SAMPLE: &str = "sample";
pub const LIBPREP: &str = "libprep";
pub const SEQRUN: &str = "seqrun";
pub const USER: &str = "user";
pub const LOG: &str = "log";

/// Doctype discriminator used by Charon documents.
pub const CHARON_DOCTYPE_FIELD: &str = "charon_doctype";

pub const BUCKET_TOTAL: &str = "TOTAL";
pub const BUCKET_TOTAL_COV: &str = "TOTAL_COV";
pub const BUCKET_SEQUENCED: &str = "SEQUENCED";
/// Analysis statuses that get their own summary bucket.
pub const ANALYSIS_BUCKETS: [&str; 3] = ["ANALYZED", "UNDER_ANALYSIS", "FAILED"];

/// Array key of the named fields; missing fields become `null`.
fn composite(doc: &Document, fields: &[&str]) -> Value {
    Value::Array(
        fields
            .iter()
            .map(|f| doc.get(f).cloned().unwrap_or_default())
            .collect(),
    )
}

/// Array key of the named fields, or `None` when any of them is missing.
fn natural_key(doc: &Document, fields: &[&str]) -> Option<Value> {
    fields
        .iter()
        .map(|f| doc.get(f).cloned())
        .collect::<Option<Vec<_>>>()
        .map(Value::Array)
}

fn field_or_null(doc: &Document, field: &str) -> Value {
    doc.get(field).cloned().unwrap_or_default()
}

fn truthy<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    doc.get(field).filter(|v| v.is_truthy())
}

// ---------------------------------------------------------------------------
// user
// ---------------------------------------------------------------------------

fn user_email(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(email) = doc.get("email") {
        out.emit(email.clone(), Value::Null);
    }
    Ok(())
}

fn user_apikey(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(key) = doc.get("apikey") {
        out.emit(key.clone(), field_or_null(doc, "email"));
    }
    Ok(())
}

fn user_api_token(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(token) = doc.get("api_token") {
        out.emit(token.clone(), field_or_null(doc, "email"));
    }
    Ok(())
}

/// Full name, plus each space-separated word when there is more than one.
fn user_name(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    let Some(name) = doc.get_nonempty_str("name") else {
        return Ok(());
    };
    let email = field_or_null(doc, "email");
    out.emit(name, email.clone());
    let parts: Vec<&str> = name.split(' ').collect();
    if parts.len() > 1 {
        for part in parts {
            out.emit(part, email.clone());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// project
// ---------------------------------------------------------------------------

fn project_projectid(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(projectid) = doc.get("projectid") {
        let name = truthy(doc, "projectname").cloned().unwrap_or_default();
        out.emit(projectid.clone(), name);
    }
    Ok(())
}

fn project_name(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(name) = truthy(doc, "name") {
        out.emit(name.clone(), field_or_null(doc, "projectid"));
    }
    Ok(())
}

/// Full name, plus the segment after the first dot.
fn project_splitname(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    let Some(name) = doc.get_nonempty_str("name") else {
        return Ok(());
    };
    let projectid = field_or_null(doc, "projectid");
    out.emit(name, projectid.clone());
    if let Some(second) = name.split('.').nth(1) {
        out.emit(second, projectid);
    }
    Ok(())
}

fn project_modified(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(modified) = truthy(doc, "modified") {
        out.emit(modified.clone(), field_or_null(doc, "projectid"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sample
// ---------------------------------------------------------------------------

fn sample_sampleid(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(key) = natural_key(doc, &["projectid", "sampleid"]) {
        out.emit(key, Value::Null);
    }
    Ok(())
}

fn sample_modified(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(modified) = truthy(doc, "modified") {
        out.emit(modified.clone(), composite(doc, &["projectid", "sampleid"]));
    }
    Ok(())
}

fn sample_not_done(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if doc.get_str("status") != Some("DONE") {
        out.emit(composite(doc, &["projectid", "sampleid"]), doc.to_value());
    }
    Ok(())
}

fn sample_count(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(projectid) = doc.get("projectid") {
        out.emit(projectid.clone(), Value::Null);
    }
    Ok(())
}

/// `[bucket, projectid]` keys; group level 1 gives the overall figure,
/// group level 2 the per-project one.
fn sample_summary(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    let projectid = field_or_null(doc, "projectid");
    let bucket = |name: &str| Value::Array(vec![Value::from(name), projectid.clone()]);

    out.emit(bucket(BUCKET_TOTAL), 1);
    out.emit(bucket(BUCKET_TOTAL_COV), field_or_null(doc, "total_autosomal_coverage"));
    if let Some(status) = doc.get_str("analysis_status")
        && ANALYSIS_BUCKETS.iter().any(|b| *b == status)
    {
        out.emit(bucket(status), 1);
    }
    Ok(())
}

/// One `[SEQUENCED, projectid, sampleid]` entry per run. Distinct samples
/// are the distinct groups at level 3.
fn seqrun_summary(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    let mut key = vec![Value::from(BUCKET_SEQUENCED)];
    if let Value::Array(parts) = composite(doc, &["projectid", "sampleid"]) {
        key.extend(parts);
    }
    out.emit(Value::Array(key), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// libprep
// ---------------------------------------------------------------------------

fn libprep_libprepid(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(key) = natural_key(doc, &["projectid", "sampleid", "libprepid"]) {
        out.emit(key, Value::Null);
    }
    Ok(())
}

fn libprep_modified(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(modified) = truthy(doc, "modified") {
        out.emit(
            modified.clone(),
            composite(doc, &["projectid", "sampleid", "libprepid"]),
        );
    }
    Ok(())
}

fn libprep_count(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(key) = natural_key(doc, &["projectid", "sampleid"]) {
        out.emit(key, Value::Null);
    }
    Ok(())
}

/// Number of sequencing runs recorded on a library preparation.
fn libprep_seqrun_count(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(seqruns) = doc.get_array("seqruns") {
        out.emit(
            composite(doc, &["projectid", "sampleid", "libprepid"]),
            seqruns.len(),
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// seqrun
// ---------------------------------------------------------------------------

fn seqrun_seqrunid(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    out.emit(
        composite(doc, &["projectid", "sampleid", "libprepid", "seqrunid"]),
        Value::Null,
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// log
// ---------------------------------------------------------------------------

/// Audit entries keyed by the id of the document they describe, valued by
/// their timestamp.
fn log_doc(doc: &Document, out: &mut EmissionBuffer) -> ProjectionResult {
    if let Some(target) = doc.get("doc") {
        out.emit(target.clone(), field_or_null(doc, "timestamp"));
    }
    Ok(())
}

/// Every built-in Charon view.
pub fn charon_views() -> Vec<ViewDefinition> {
    let single = |id: &str, doctype: &str, strategy: fn(&Document, &mut EmissionBuffer) -> ProjectionResult| {
        ViewDefinition::new(id, DoctypeRouter::new().route_fn(doctype, strategy))
    };

    vec![
        single("user/email", USER, user_email),
        single("user/apikey", USER, user_apikey),
        single("user/api_token", USER, user_api_token),
        single("user/name", USER, user_name),
        single("project/projectid", PROJECT, project_projectid),
        single("project/name", PROJECT, project_name),
        single("project/splitname", PROJECT, project_splitname),
        single("project/modified", PROJECT, project_modified),
        single("sample/sampleid", SAMPLE, sample_sampleid),
        single("sample/modified", SAMPLE, sample_modified),
        single("sample/not_done", SAMPLE, sample_not_done),
        single("sample/count", SAMPLE, sample_count).with_reduce(ReduceSpec::Count),
        ViewDefinition::new(
            "sample/summary_count",
            DoctypeRouter::new()
                .route_fn(SAMPLE, sample_summary)
                .route_fn(SEQRUN, seqrun_summary),
        )
        .with_reduce(ReduceSpec::sum()),
        single("libprep/libprepid", LIBPREP, libprep_libprepid),
        single("libprep/modified", LIBPREP, libprep_modified),
        single("libprep/count", LIBPREP, libprep_count).with_reduce(ReduceSpec::Count),
        single("seqrun/seqrunid", SEQRUN, seqrun_seqrunid),
        single("seqrun/count", LIBPREP, libprep_seqrun_count).with_reduce(ReduceSpec::sum()),
        single("log/doc", LOG, log_doc),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::project_document;

    fn keys(view: &str, doc: &Document) -> Vec<Value> {
        let views = charon_views();
        let def = views.iter().find(|v| v.id() == view).unwrap();
        project_document(def.projection().as_ref(), doc)
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect()
    }

    #[test]
    fn test_user_name_emits_words() {
        let doc = Document::new("u1", Some(USER))
            .with_field("name", "Ada Lovelace")
            .with_field("email", "ada@example.org");
        assert_eq!(
            keys("user/name", &doc),
            vec![Value::from("Ada Lovelace"), Value::from("Ada"), Value::from("Lovelace")]
        );

        let single = Document::new("u2", Some(USER)).with_field("name", "Ada");
        assert_eq!(keys("user/name", &single), vec![Value::from("Ada")]);
    }

    #[test]
    fn test_splitname_emits_second_segment() {
        let doc = Document::new("p1", Some(PROJECT))
            .with_field("name", "Smith.Genome.2015")
            .with_field("projectid", "P1");
        assert_eq!(
            keys("project/splitname", &doc),
            vec![Value::from("Smith.Genome.2015"), Value::from("Genome")]
        );
    }

    #[test]
    fn test_missing_fields_skip_emission() {
        let doc = Document::new("p1", Some(PROJECT));
        assert!(keys("project/name", &doc).is_empty());
        assert!(keys("project/modified", &doc).is_empty());
        assert!(keys("project/projectid", &doc).is_empty());

        let libprep = Document::new("l1", Some(LIBPREP)).with_field("projectid", "P1");
        assert!(keys("seqrun/count", &libprep).is_empty());
        assert!(keys("libprep/libprepid", &libprep).is_empty());
    }

    #[test]
    fn test_wrong_doctype_emits_nothing() {
        let doc = Document::new("s1", Some(SAMPLE)).with_field("email", "x@y");
        assert!(keys("user/email", &doc).is_empty());
    }

    #[test]
    fn test_summary_buckets() {
        let sample = Document::new("s1", Some(SAMPLE))
            .with_field("projectid", "P1")
            .with_field("analysis_status", "FAILED")
            .with_field("total_autosomal_coverage", 30.5);
        assert_eq!(
            keys("sample/summary_count", &sample),
            vec![
                Value::from(vec!["TOTAL", "P1"]),
                Value::from(vec!["TOTAL_COV", "P1"]),
                Value::from(vec!["FAILED", "P1"]),
            ]
        );

        let run = Document::new("r1", Some(SEQRUN))
            .with_field("projectid", "P1")
            .with_field("sampleid", "S1");
        assert_eq!(
            keys("sample/summary_count", &run),
            vec![Value::from(vec!["SEQUENCED", "P1", "S1"])]
        );
    }

    #[test]
    fn test_not_done_carries_document() {
        let doc = Document::new("s1", Some(SAMPLE))
            .with_field("projectid", "P1")
            .with_field("sampleid", "S1")
            .with_field("status", "NEW");
        let views = charon_views();
        let def = views.iter().find(|v| v.id() == "sample/not_done").unwrap();
        let out = project_document(def.projection().as_ref(), &doc).unwrap();
        let emission = out.iter().next().unwrap();
        assert_eq!(emission.value.get("_id"), Some(&Value::from("s1")));

        let done = doc.with_field("status", "DONE");
        assert!(project_document(def.projection().as_ref(), &done).unwrap().is_empty());
    }

    #[test]
    fn test_log_doc_needs_a_target() {
        let entry = Document::new("l1", Some(LOG)).with_field("doc", "s1");
        assert_eq!(keys("log/doc", &entry), vec![Value::from("s1")]);
        let orphan = Document::new("l2", Some(LOG)).with_field("timestamp", "2024-01-01");
        assert!(keys("log/doc", &orphan).is_empty());
    }

    #[test]
    fn test_view_ids_are_unique() {
        let views = charon_views();
        let mut ids: Vec<_> = views.iter().map(|v| v.id().to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), views.len());
    }
}
