//! The regex code-search service.
//!
//! Startup loads every `.csi` index on the fast disk. A request compiles the
//! regex once, derives a trigram query from the same pattern, and walks the
//! indexes in package order: posting lists shortlist candidate files, path
//! globs and the pagination cursor narrow them further, and each surviving
//! file is scanned from the bulk disk under a per-request visit budget.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sift_trigram::{Index, Query};
use walkdir::WalkDir;

use crate::layout;
use crate::scanner::Scanner;

/// Per-request cap on files opened and scanned.
pub const DEFAULT_MAX_FILE_VISITS: usize = 500;

pub struct GrepServer {
    distros: HashMap<String, Vec<PackageIndex>>,
    bulk_dir: PathBuf,
    commit: String,
    pub max_file_visits: usize,
}

struct PackageIndex {
    package: String,
    index: Index,
}

/// A parsed and validated query, ready to execute.
pub struct GrepRequest {
    pub query: String,
    pub flags: String,
    pub context: usize,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub after: Option<String>,
}

pub struct Prepared {
    query: String,
    flags: String,
    context: usize,
    regex: regex::bytes::Regex,
    trigram: Query,
    include_patterns: Vec<String>,
    exclude_patterns: Vec<String>,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    after: Option<String>,
}

/// What the trailer reports after the streamed records.
pub struct Summary {
    pub count: usize,
    pub errors: Vec<String>,
    pub resume: Option<String>,
    pub elapsed: std::time::Duration,
}

impl GrepServer {
    /// Opens every `<fast>/grep/<distro>/<prefix>/<pkg>/*.csi` for the
    /// configured distributions. A distribution with no indexes is a startup
    /// error.
    pub fn load(
        fast_dir: &Path,
        bulk_dir: &Path,
        distro_names: &[String],
        commit: String,
    ) -> Result<GrepServer> {
        let mut distros = HashMap::new();
        for name in distro_names {
            let root = fast_dir.join("grep").join(name);
            let mut indexes = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        bail!("failed to walk {}: {err}", root.display());
                    }
                };
                if !entry.file_type().is_file()
                    || entry.path().extension().and_then(|e| e.to_str()) != Some("csi")
                {
                    continue;
                }
                let package = entry
                    .path()
                    .parent()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let file = File::open(entry.path())
                    .with_context(|| format!("failed to open {}", entry.path().display()))?;
                let index = Index::read(std::io::BufReader::new(file))
                    .with_context(|| format!("failed to read {}", entry.path().display()))?;
                indexes.push(PackageIndex { package, index });
            }
            if indexes.is_empty() {
                bail!("no indexes found for distro {name}");
            }
            indexes.sort_by(|a, b| a.package.cmp(&b.package));
            tracing::info!(distro = name, indexes = indexes.len(), "loaded indexes");
            distros.insert(name.clone(), indexes);
        }
        Ok(GrepServer {
            distros,
            bulk_dir: bulk_dir.to_path_buf(),
            commit,
            max_file_visits: DEFAULT_MAX_FILE_VISITS,
        })
    }

    pub fn welcome(&self) -> String {
        format!("Hello from grep@{}!\n", self.commit)
    }

    pub fn knows_distro(&self, distro: &str) -> bool {
        self.distros.contains_key(distro)
    }

    /// Validates a request and compiles its regex, trigram query and globs.
    /// Returns the HTTP status code on rejection.
    pub fn prepare(&self, distro: &str, request: &GrepRequest) -> Result<Prepared, u16> {
        if !self.knows_distro(distro) {
            return Err(404);
        }
        if request.query.is_empty() {
            return Err(400);
        }
        if request.flags.chars().any(|c| !"mis".contains(c)) {
            return Err(400);
        }
        let insensitive = request.flags.contains('i');
        let dotall = request.flags.contains('s');
        let context = request.context.min(10);

        // Multi-line is always on: the scanner cannot tell the regex engine
        // where the file starts and ends, so ^ and $ must match at newlines.
        let regex = regex::bytes::RegexBuilder::new(&request.query)
            .multi_line(true)
            .case_insensitive(insensitive)
            .dot_matches_new_line(dotall)
            .build()
            .map_err(|_| 400u16)?;

        let hir = regex_syntax::ParserBuilder::new()
            .multi_line(true)
            .case_insensitive(insensitive)
            .dot_matches_new_line(dotall)
            .utf8(false)
            .build()
            .parse(&request.query)
            .map_err(|_| 400u16)?;
        let trigram = sift_trigram::from_hir(&hir);

        let include = build_globset(&request.include).map_err(|_| 400u16)?;
        let exclude = build_globset(&request.exclude).map_err(|_| 400u16)?;

        Ok(Prepared {
            query: request.query.clone(),
            flags: request.flags.clone(),
            context,
            regex,
            trigram,
            include_patterns: request.include.clone(),
            exclude_patterns: request.exclude.clone(),
            include,
            exclude,
            after: request.after.clone(),
        })
    }

    /// Runs a prepared query, pushing each match record into the sink. The
    /// sink returns `false` when the client has gone away; the scan stops.
    pub fn execute(
        &self,
        distro: &str,
        prepared: &Prepared,
        sink: &mut dyn FnMut(String) -> bool,
    ) -> Summary {
        let start = Instant::now();
        let mut scanner = Scanner::new();
        let mut summary = Summary {
            count: 0,
            errors: Vec::new(),
            resume: None,
            elapsed: std::time::Duration::ZERO,
        };

        let after_package = prepared
            .after
            .as_deref()
            .map(|a| a.split('/').next().unwrap_or(a).to_string());

        let indexes = match self.distros.get(distro) {
            Some(indexes) => indexes,
            None => return summary,
        };

        let mut visited = 0;
        let mut cancelled = false;
        'indexes: for entry in indexes {
            // Pagination: everything at or before the cursor's package was
            // served on a previous page.
            if let Some(after_pkg) = &after_package {
                if entry.package.as_str() <= after_pkg.as_str() {
                    continue;
                }
            }
            if !include_may_match_package(&prepared.include_patterns, &entry.package) {
                continue;
            }
            if exclude_covers_package(&prepared.exclude_patterns, &entry.package) {
                continue;
            }

            for id in entry.index.posting_query(&prepared.trigram) {
                let name = entry.index.name(id);
                if let Some(include) = &prepared.include {
                    if !include.is_match(name) {
                        continue;
                    }
                }
                if let Some(exclude) = &prepared.exclude {
                    if exclude.is_match(name) {
                        continue;
                    }
                }
                if let Some(after) = &prepared.after {
                    if name <= after.as_str() {
                        continue;
                    }
                }

                let local = self
                    .bulk_dir
                    .join("grep")
                    .join(distro)
                    .join(layout::package_prefix(&entry.package))
                    .join(name);
                let file = match File::open(&local) {
                    Ok(file) => file,
                    Err(err) => {
                        // Indexed but unreadable: report and keep scanning.
                        summary.errors.push(format!("{name}: {err}"));
                        continue;
                    }
                };

                visited += 1;
                let mut forward = |record: String| {
                    if sink(record) {
                        true
                    } else {
                        cancelled = true;
                        false
                    }
                };
                match scanner.scan(file, name, &prepared.regex, prepared.context, &mut forward) {
                    Ok(count) => summary.count += count,
                    Err(err) => summary.errors.push(err.to_string()),
                }
                if cancelled {
                    break 'indexes;
                }
                if visited >= self.max_file_visits {
                    summary.resume = Some(name.to_string());
                    break 'indexes;
                }
            }
        }

        summary.elapsed = start.elapsed();
        summary
    }

    /// Renders the per-request trailer.
    pub fn trailer(prepared: &Prepared, summary: &Summary) -> String {
        let mut out = String::from("\n");
        out.push_str(&format!("Query: {:?}\n", prepared.query));
        out.push_str(&format!("Flags: {}\n", prepared.flags));
        out.push_str(&format!("Context: {}\n", prepared.context));
        if !prepared.include_patterns.is_empty() {
            out.push_str(&format!(
                "Include: {}\n",
                prepared.include_patterns.join(", ")
            ));
        }
        if !prepared.exclude_patterns.is_empty() {
            out.push_str(&format!(
                "Exclude: {}\n",
                prepared.exclude_patterns.join(", ")
            ));
        }
        out.push_str(&format!("Results: {}\n", summary.count));
        out.push_str(&format!("Time: {:?}\n", summary.elapsed));
        out.push_str(&format!("Errors: {}\n", summary.errors.len()));
        for error in &summary.errors {
            out.push_str(&format!("Error: {error}\n"));
        }
        if let Some(resume) = &summary.resume {
            out.push_str(&format!("Resume: {resume}\n"));
        }
        out
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        // `*` stays within one path component; `**` crosses separators.
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid glob {pattern}"))?;
        builder.add(glob);
    }
    Ok(Some(builder.build()?))
}

/// The literal prefix of a glob pattern, up to its first metacharacter.
fn glob_literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Whether any include glob could match a path under `<package>/`. Candidate
/// paths all start with the package name, so an include whose literal prefix
/// diverges from it can never match.
fn include_may_match_package(patterns: &[String], package: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| {
        let literal = glob_literal_prefix(pattern);
        let root = format!("{package}/");
        literal.starts_with(&root) || root.starts_with(literal)
    })
}

/// Whether an exclude glob necessarily matches every path under
/// `<package>/`: a `<dir>/**` pattern whose directory prefixes the package
/// root.
fn exclude_covers_package(patterns: &[String], package: &str) -> bool {
    patterns.iter().any(|pattern| {
        let literal = glob_literal_prefix(pattern);
        let rest = &pattern[literal.len()..];
        rest == "**"
            && literal.ends_with('/')
            && format!("{package}/").starts_with(literal)
    })
}

/// The VS Code extension host's fetch gets its results as an event stream;
/// plain text would be buffered by intermediaries until the request ends.
pub fn response_content_type(user_agent: &str, fetch_mode: &str) -> &'static str {
    if user_agent.contains("Code/") && fetch_mode == "cors" {
        "text/event-stream; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_trigram::IndexBuilder;
    use std::fs;

    fn write_package(
        fast: &Path,
        bulk: &Path,
        distro: &str,
        package: &str,
        files: &[(&str, &str)],
    ) {
        let mut builder = IndexBuilder::new();
        for (rel, contents) in files {
            let name = format!("{package}/{rel}");
            builder.add(&name, contents.as_bytes());
            let local = layout::local_dir(bulk, distro, package).join(rel);
            fs::create_dir_all(local.parent().unwrap()).unwrap();
            fs::write(local, contents).unwrap();
        }
        let dir = layout::local_dir(fast, distro, package);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(layout::artifact_filename(package, "1.0", 4, "csi")),
            builder.to_bytes().unwrap(),
        )
        .unwrap();
    }

    fn test_server(temp: &tempfile::TempDir) -> GrepServer {
        let fast = temp.path().join("fast");
        let bulk = temp.path().join("bulk");
        write_package(
            &fast,
            &bulk,
            "hirsute",
            "alpha",
            &[
                ("src/main.c", "int main() { return frobnicate(); }\n"),
                ("README", "alpha does nothing useful\n"),
            ],
        );
        write_package(
            &fast,
            &bulk,
            "hirsute",
            "beta",
            &[("beta.c", "void frobnicate(void) {}\nint other;\n")],
        );
        GrepServer::load(&fast, &bulk, &["hirsute".to_string()], "test".into()).unwrap()
    }

    fn request(query: &str) -> GrepRequest {
        GrepRequest {
            query: query.to_string(),
            flags: "m".to_string(),
            context: 0,
            include: Vec::new(),
            exclude: Vec::new(),
            after: None,
        }
    }

    fn run(server: &GrepServer, req: &GrepRequest) -> (Vec<String>, Summary) {
        let prepared = server.prepare("hirsute", req).unwrap();
        let mut records = Vec::new();
        let summary = server.execute("hirsute", &prepared, &mut |r| {
            records.push(r);
            true
        });
        (records, summary)
    }

    #[test]
    fn finds_matches_across_packages_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        let (records, summary) = run(&server, &request("frobnicate"));
        assert_eq!(2, summary.count);
        assert!(records[0].starts_with("alpha/src/main.c 1 "));
        assert!(records[1].starts_with("beta/beta.c 1 "));
        assert!(summary.errors.is_empty());
        assert!(summary.resume.is_none());
    }

    #[test]
    fn unknown_distro_and_bad_regex_are_client_errors() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        assert_eq!(Err(404), server.prepare("focal", &request("x")).map(|_| ()));
        assert_eq!(
            Err(400),
            server.prepare("hirsute", &request("(")).map(|_| ())
        );
        assert_eq!(
            Err(400),
            server.prepare("hirsute", &request("")).map(|_| ())
        );
        let mut bad_flags = request("x");
        bad_flags.flags = "mz".into();
        assert_eq!(
            Err(400),
            server.prepare("hirsute", &bad_flags).map(|_| ())
        );
    }

    #[test]
    fn include_globs_narrow_the_search() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        let mut req = request("frobnicate");
        req.include = vec!["alpha/**".to_string()];
        let (records, summary) = run(&server, &req);
        assert_eq!(1, summary.count);
        assert!(records[0].starts_with("alpha/src/main.c"));
    }

    #[test]
    fn exclude_globs_drop_whole_packages() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        let mut req = request("frobnicate");
        req.exclude = vec!["alpha/**".to_string()];
        let (records, summary) = run(&server, &req);
        assert_eq!(1, summary.count);
        assert!(records[0].starts_with("beta/beta.c"));
    }

    #[test]
    fn after_cursor_resumes_past_a_package() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        let mut req = request("frobnicate");
        req.after = Some("alpha/src/main.c".to_string());
        let (records, summary) = run(&server, &req);
        assert_eq!(1, summary.count);
        assert!(records[0].starts_with("beta/beta.c"));
    }

    #[test]
    fn visit_budget_truncates_with_a_resume_cursor() {
        let temp = tempfile::tempdir().unwrap();
        let mut server = test_server(&temp);
        server.max_file_visits = 1;
        let (records, summary) = run(&server, &request("frobnicate"));
        assert_eq!(1, records.len());
        assert_eq!(Some("alpha/src/main.c".to_string()), summary.resume);
    }

    #[test]
    fn missing_local_file_is_reported_and_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        fs::remove_file(
            layout::local_dir(&temp.path().join("bulk"), "hirsute", "alpha")
                .join("src/main.c"),
        )
        .unwrap();
        let (records, summary) = run(&server, &request("frobnicate"));
        assert_eq!(1, summary.count);
        assert!(records[0].starts_with("beta/beta.c"));
        assert_eq!(1, summary.errors.len());
        assert!(summary.errors[0].starts_with("alpha/src/main.c"));
    }

    #[test]
    fn case_insensitive_flag_reaches_the_regex() {
        let temp = tempfile::tempdir().unwrap();
        let server = test_server(&temp);
        let mut req = request("FROBNICATE");
        req.flags = "mi".into();
        let (_, summary) = run(&server, &req);
        assert_eq!(2, summary.count);
    }

    #[test]
    fn package_prefilters_agree_with_the_globs() {
        assert!(include_may_match_package(
            &["alpha/**".to_string()],
            "alpha"
        ));
        assert!(include_may_match_package(&["al*/x.c".to_string()], "alpha"));
        assert!(!include_may_match_package(
            &["beta/**".to_string()],
            "alpha"
        ));
        assert!(exclude_covers_package(&["alpha/**".to_string()], "alpha"));
        assert!(
            !exclude_covers_package(&["al**".to_string()], "alpha"),
            "a non-directory prefix does not cover the package"
        );
        assert!(!exclude_covers_package(
            &["alpha/src/**".to_string()],
            "alpha"
        ));
    }

    #[test]
    fn content_type_switches_for_the_extension_host() {
        assert_eq!(
            "text/event-stream; charset=utf-8",
            response_content_type("Code/1.60.0 Electron", "cors")
        );
        assert_eq!(
            "text/plain; charset=utf-8",
            response_content_type("curl/8.0", "")
        );
    }
}
