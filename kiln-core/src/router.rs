//! Hierarchical resource addressing.
//!
//! Each endpoint declares an ordered list of path patterns; a pattern is a
//! sequence of literal segments and typed parameters (`n:` numeric, `i:`
//! identifier). Resolution tries the patterns in declaration order and the
//! first full match binds its parameters. A path that matches no declared
//! pattern is rejected as `UnknownPath`; a matched path whose hops fail to
//! resolve yields absence (`None` / empty vec), never an error.

use crate::entities::EntityStore;
use crate::error::{KilnError, Result};
use crate::logs::{LogData, LogStore};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// Matches a digit-only token, binding an `i64`.
    Numeric(String),
    /// Matches any non-empty token that is not digit-only (digit-only
    /// tokens always bind numeric parameters, keeping alternation between
    /// `i:step_name` and `n:step_number` deterministic).
    Ident(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathParam {
    Int(i64),
    Str(String),
}

/// Parameters bound by a matched pattern.
#[derive(Debug, Clone, Default)]
pub struct PathParams(HashMap<String, PathParam>);

impl PathParams {
    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(PathParam::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(PathParam::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathPattern {
    segments: Vec<Segment>,
}

impl PathPattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .trim()
            .trim_start_matches('/')
            .split('/')
            .map(|seg| {
                if let Some(name) = seg.strip_prefix("n:") {
                    Segment::Numeric(name.to_string())
                } else if let Some(name) = seg.strip_prefix("i:") {
                    Segment::Ident(name.to_string())
                } else {
                    Segment::Literal(seg.to_string())
                }
            })
            .collect();
        Self { segments }
    }

    fn matches(&self, parts: &[&str]) -> Option<PathParams> {
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = PathParams::default();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != part {
                        return None;
                    }
                }
                Segment::Numeric(name) => {
                    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    let value = part.parse().ok()?;
                    params.0.insert(name.clone(), PathParam::Int(value));
                }
                Segment::Ident(name) => {
                    if part.is_empty() || part.bytes().all(|b| b.is_ascii_digit()) {
                        return None;
                    }
                    params
                        .0
                        .insert(name.clone(), PathParam::Str((*part).to_string()));
                }
            }
        }
        Some(params)
    }
}

/// Parse a multiline pattern declaration into ordered patterns.
fn parse_patterns(decl: &str) -> Vec<PathPattern> {
    decl.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathPattern::parse)
        .collect()
}

/// Match `path` against `patterns` in declaration order.
fn match_path(patterns: &[PathPattern], path: &str) -> Result<PathParams> {
    let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    patterns
        .iter()
        .find_map(|pattern| pattern.matches(&parts))
        .ok_or_else(|| KilnError::UnknownPath(path.to_string()))
}

/// Resolve the build hop: either directly addressed, or reached through a
/// builder (by id or by name) and a build number.
fn resolve_buildid(entities: &EntityStore, params: &PathParams) -> Result<Option<i64>> {
    if let Some(buildid) = params.int("buildid") {
        return Ok(Some(buildid));
    }

    let builder_id = if let Some(builderid) = params.int("builderid") {
        Some(builderid)
    } else if let Some(name) = params.str("buildername") {
        entities.get_builder_id_by_name(name)?
    } else {
        None
    };
    let Some(builder_id) = builder_id else {
        return Ok(None);
    };
    let Some(number) = params.int("build_number") else {
        return Ok(None);
    };
    entities.get_build_id(builder_id, number)
}

/// Resolve the step hop from whichever keys the matched pattern bound.
fn resolve_stepid(entities: &EntityStore, params: &PathParams) -> Result<Option<i64>> {
    if let Some(stepid) = params.int("stepid") {
        return Ok(Some(stepid));
    }

    let Some(build_id) = resolve_buildid(entities, params)? else {
        return Ok(None);
    };
    if let Some(name) = params.str("step_name") {
        return entities.get_step_id_by_name(build_id, name);
    }
    if let Some(number) = params.int("step_number") {
        return entities.get_step_id_by_number(build_id, number);
    }
    Ok(None)
}

const LOG_PATH_PATTERNS: &str = "
    /logs/n:logid
    /steps/n:stepid/logs/i:log_slug
    /builds/n:buildid/steps/i:step_name/logs/i:log_slug
    /builds/n:buildid/steps/n:step_number/logs/i:log_slug
    /builders/n:builderid/builds/n:build_number/steps/i:step_name/logs/i:log_slug
    /builders/n:builderid/builds/n:build_number/steps/n:step_number/logs/i:log_slug
    /builders/i:buildername/builds/n:build_number/steps/i:step_name/logs/i:log_slug
    /builders/i:buildername/builds/n:build_number/steps/n:step_number/logs/i:log_slug
";

const LOGS_PATH_PATTERNS: &str = "
    /steps/n:stepid/logs
    /builds/n:buildid/steps/i:step_name/logs
    /builds/n:buildid/steps/n:step_number/logs
    /builders/n:builderid/builds/n:build_number/steps/i:step_name/logs
    /builders/n:builderid/builds/n:build_number/steps/n:step_number/logs
    /builders/i:buildername/builds/n:build_number/steps/i:step_name/logs
    /builders/i:buildername/builds/n:build_number/steps/n:step_number/logs
";

/// Single-resource endpoint: one log, addressed by any of its aliases.
#[derive(Debug, Clone)]
pub struct LogEndpoint {
    patterns: Vec<PathPattern>,
    logs: LogStore,
    entities: EntityStore,
}

impl LogEndpoint {
    pub fn new(logs: LogStore, entities: EntityStore) -> Self {
        Self {
            patterns: parse_patterns(LOG_PATH_PATTERNS),
            logs,
            entities,
        }
    }

    /// Resolve `path` to the log it addresses, or absence if any hop fails.
    pub fn get(&self, path: &str) -> Result<Option<LogData>> {
        let params = match_path(&self.patterns, path)?;

        if let Some(logid) = params.int("logid") {
            return self.logs.get_log(logid);
        }

        let Some(stepid) = resolve_stepid(&self.entities, &params)? else {
            return Ok(None);
        };
        let Some(slug) = params.str("log_slug") else {
            return Ok(None);
        };
        self.logs.get_log_by_slug(stepid, slug)
    }
}

/// Collection endpoint: all logs of a step. Order is whatever the store
/// returns; it is not guaranteed stable across calls.
#[derive(Debug, Clone)]
pub struct LogsEndpoint {
    patterns: Vec<PathPattern>,
    logs: LogStore,
    entities: EntityStore,
}

impl LogsEndpoint {
    pub fn new(logs: LogStore, entities: EntityStore) -> Self {
        Self {
            patterns: parse_patterns(LOGS_PATH_PATTERNS),
            logs,
            entities,
        }
    }

    pub fn get(&self, path: &str) -> Result<Vec<LogData>> {
        let params = match_path(&self.patterns, path)?;
        let Some(stepid) = resolve_stepid(&self.entities, &params)? else {
            return Ok(Vec::new());
        };
        self.logs.get_logs(stepid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::db::Db;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        single: LogEndpoint,
        collection: LogsEndpoint,
        log_id: i64,
        step_id: i64,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Db::open(temp_dir.path().join("kiln.db")).unwrap();
        let entities = EntityStore::new(db.clone());
        let logs = LogStore::new(db, EventBus::new());

        let builder_id = entities.find_builder_id("runtests").unwrap();
        let build_id = entities.add_build(builder_id, 1).unwrap();
        let step_id = entities.add_step(build_id, 0, "compile").unwrap();
        let log_id = logs.add_log(step_id, "stdio", "s").unwrap();

        Fixture {
            _temp_dir: temp_dir,
            single: LogEndpoint::new(logs.clone(), entities.clone()),
            collection: LogsEndpoint::new(logs, entities),
            log_id,
            step_id,
        }
    }

    #[test]
    fn test_alias_equivalence() {
        let f = fixture();
        let builder_paths = [
            format!("/logs/{}", f.log_id),
            format!("/steps/{}/logs/stdio", f.step_id),
        ];
        let nested_paths = [
            "/builds/1/steps/compile/logs/stdio".to_string(),
            "/builds/1/steps/0/logs/stdio".to_string(),
            "/builders/1/builds/1/steps/compile/logs/stdio".to_string(),
            "/builders/1/builds/1/steps/0/logs/stdio".to_string(),
            "/builders/runtests/builds/1/steps/compile/logs/stdio".to_string(),
            "/builders/runtests/builds/1/steps/0/logs/stdio".to_string(),
        ];
        for path in builder_paths.iter().chain(nested_paths.iter()) {
            let log = f.single.get(path).unwrap().unwrap_or_else(|| {
                panic!("path {} did not resolve", path);
            });
            assert_eq!(log.logid, f.log_id, "path {}", path);
        }
    }

    #[test]
    fn test_failed_hop_is_absence_not_error() {
        let f = fixture();
        assert!(f.single.get("/logs/999").unwrap().is_none());
        assert!(
            f.single
                .get("/builders/nosuch/builds/1/steps/compile/logs/stdio")
                .unwrap()
                .is_none()
        );
        assert!(
            f.single
                .get("/builders/runtests/builds/99/steps/compile/logs/stdio")
                .unwrap()
                .is_none()
        );
        assert!(
            f.single
                .get(&format!("/steps/{}/logs/nosuch", f.step_id))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_unmatched_shape_is_rejected() {
        let f = fixture();
        let err = f.single.get("/bogus/3").unwrap_err();
        assert!(matches!(err, KilnError::UnknownPath(_)));

        // A non-numeric token where only a numeric parameter is declared.
        let err = f.single.get("/logs/abc").unwrap_err();
        assert!(matches!(err, KilnError::UnknownPath(_)));

        // Collection shape against the single endpoint.
        let err = f.single.get(&format!("/steps/{}/logs", f.step_id)).unwrap_err();
        assert!(matches!(err, KilnError::UnknownPath(_)));
    }

    #[test]
    fn test_collection_endpoint() {
        let f = fixture();
        let logs = f
            .collection
            .get(&format!("/steps/{}/logs", f.step_id))
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].logid, f.log_id);

        let logs = f
            .collection
            .get("/builders/runtests/builds/1/steps/compile/logs")
            .unwrap();
        assert_eq!(logs.len(), 1);

        // Failed hop yields an empty collection.
        let logs = f.collection.get("/steps/999/logs").unwrap();
        assert!(logs.is_empty());
        let logs = f
            .collection
            .get("/builders/nosuch/builds/1/steps/compile/logs")
            .unwrap();
        assert!(logs.is_empty());
    }

    #[test]
    fn test_numeric_token_binds_step_number_not_name() {
        let f = fixture();
        // "0" must route to the step_number alternative even though the
        // step-name pattern is declared first.
        let log = f.single.get("/builds/1/steps/0/logs/stdio").unwrap();
        assert_eq!(log.unwrap().logid, f.log_id);
    }
}
