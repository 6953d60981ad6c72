//! The fuzzy-path query service.
//!
//! Per-distribution indexes are fetched from the metadata bucket on first
//! use and cached in memory. A query is evaluated by a pool of shard workers
//! that each traverse whole package trees into a private bounded heap; the
//! shard results are merged through one final heap and rendered as plain
//! text.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use url::Url;

use crate::heap::{ScoredPath, TopK};
use crate::matcher::Matcher;
use crate::node::{self, Node};

pub struct Server {
    meta: Url,
    commit: String,
    pub parallelism: usize,
    pub result_limit: usize,
    cache: RwLock<HashMap<String, Arc<Vec<Node>>>>,
}

/// Outcome of a query against one distribution, ready for rendering.
pub struct QueryOutput {
    pub status: u16,
    pub body: String,
}

impl Server {
    pub fn new(meta: Url, commit: String) -> Server {
        Server {
            meta,
            commit,
            parallelism: 8,
            result_limit: 100,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn welcome(&self) -> String {
        format!("Hello from fzf@{}!", self.commit)
    }

    /// Loads the consolidated index for a distribution unless it is already
    /// cached. Returns the package roots and whether the cache was warm.
    ///
    /// Two racing first requests may both download the index; the second
    /// write simply replaces an identical value, so the cache stays
    /// consistent.
    pub fn ensure_index(&self, distro: &str) -> Result<(Arc<Vec<Node>>, bool)> {
        if let Some(roots) = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(distro).cloned())
        {
            return Ok((roots, true));
        }

        let data = sift_internal::download(&self.meta, &[distro, "paths.fzf"])
            .with_context(|| format!("failed to fetch index for {distro}"))?;
        let roots = Arc::new(
            node::decode_index(&data)
                .with_context(|| format!("failed to decode index for {distro}"))?,
        );
        tracing::info!(distro, packages = roots.len(), "loaded fuzzy index");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(distro.to_string(), Arc::clone(&roots));
        }
        Ok((roots, false))
    }

    /// Handles `GET /{distro}?q={query}`. Blocking; run it off the async
    /// reactor.
    pub fn handle_query(&self, distro: &str, query: Option<&str>) -> QueryOutput {
        let start = Instant::now();

        let (roots, warm) = match self.ensure_index(distro) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::debug!(distro, error = ?err, "index unavailable");
                return QueryOutput {
                    status: 404,
                    body: sift_internal::http_error_body(404),
                };
            }
        };

        let query = match query {
            Some(q) if !q.is_empty() => q,
            _ => {
                return QueryOutput {
                    status: 400,
                    body: sift_internal::http_error_body(400),
                }
            }
        };
        let matcher = match Matcher::new(query) {
            Ok(matcher) => matcher,
            Err(_) => {
                return QueryOutput {
                    status: 400,
                    body: sift_internal::http_error_body(400),
                }
            }
        };

        let results = self.evaluate(&roots, &matcher);

        let mut body = String::new();
        for result in &results {
            body.push_str(&format!("{} {}\n", result.score, result.path));
        }
        body.push('\n');
        body.push_str(&format!("Query: {query:?}\n"));
        if results.len() >= self.result_limit {
            body.push_str(&format!("Results: {} (truncated)\n", results.len()));
        } else {
            body.push_str(&format!("Results: {}\n", results.len()));
        }
        body.push_str(&format!("Time: {:?}\n", start.elapsed()));
        body.push_str(&format!("Warm: {warm}\n"));

        QueryOutput { status: 200, body }
    }

    /// Evaluates the matcher over every package tree with a pool of shard
    /// workers. Each shard keeps its own bounded heap; the shards drain into
    /// a channel and the caller's heap performs the final merge.
    fn evaluate(&self, roots: &Arc<Vec<Node>>, matcher: &Matcher) -> Vec<ScoredPath> {
        let limit = self.result_limit;

        let (job_tx, job_rx) = mpsc::channel::<usize>();
        for index in 0..roots.len() {
            // Receiver outlives this loop; the send cannot fail.
            let _ = job_tx.send(index);
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let (result_tx, result_rx) =
            mpsc::sync_channel::<ScoredPath>(self.parallelism * limit);

        let mut merged = TopK::new();
        thread::scope(|scope| {
            for _ in 0..self.parallelism {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    let mut heap = TopK::new();
                    loop {
                        let job = {
                            let Ok(guard) = job_rx.lock() else { break };
                            match guard.recv() {
                                Ok(job) => job,
                                Err(_) => break,
                            }
                        };
                        walk_node(&roots[job], matcher, &mut heap, limit);
                    }
                    while let Some(result) = heap.pop_min() {
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);

            for result in result_rx {
                merged.push_bounded(result, limit);
            }
        });

        merged.into_sorted_desc()
    }
}

fn walk_node(node: &Node, matcher: &Matcher, heap: &mut TopK, k: usize) {
    let advanced = matcher.advance(&node.name);
    for file in &node.files {
        let score = advanced.score(file);
        if score > 0 {
            heap.push_bounded(
                ScoredPath {
                    score,
                    path: advanced.target(file),
                },
                k,
            );
        }
    }
    for child in &node.children {
        walk_node(child, &advanced, heap, k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, files: &[&str]) -> Node {
        Node {
            name: component(name),
            files: files.iter().map(|f| component(f)).collect(),
            children: Vec::new(),
        }
    }

    fn component(text: &str) -> Vec<u8> {
        let mut out = vec![b'/'];
        out.extend_from_slice(text.as_bytes());
        out
    }

    fn server() -> Server {
        Server::new(
            Url::parse("https://meta.sift.codes").unwrap(),
            "test".to_string(),
        )
    }

    #[test]
    fn evaluate_reports_full_paths() {
        let roots = Arc::new(vec![Node {
            name: component("zlib"),
            files: vec![component("README")],
            children: vec![leaf("src", &["deflate.c", "inflate.c"])],
        }]);
        let matcher = Matcher::new("defl").unwrap();
        let results = server().evaluate(&roots, &matcher);
        assert_eq!(1, results.len());
        assert_eq!("/zlib/src/deflate.c", results[0].path);
        assert!(results[0].score > 0);
    }

    #[test]
    fn evaluate_merges_across_packages_descending() {
        let roots = Arc::new(vec![
            leaf("alpha", &["match_a.c", "nothing.txt"]),
            leaf("beta", &["match_b.c"]),
            leaf("gamma", &["other.rs"]),
        ]);
        let matcher = Matcher::new("match").unwrap();
        let results = server().evaluate(&roots, &matcher);
        assert_eq!(2, results.len());
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn evaluate_respects_the_result_limit() {
        let files: Vec<String> = (0..300).map(|i| format!("file{i:03}.c")).collect();
        let refs: Vec<&str> = files.iter().map(String::as_str).collect();
        let roots = Arc::new(vec![leaf("pkg", &refs)]);
        let matcher = Matcher::new("file").unwrap();
        let mut server = server();
        server.result_limit = 100;
        let results = server.evaluate(&roots, &matcher);
        assert_eq!(100, results.len());
    }

    #[test]
    fn missing_query_is_a_bad_request() {
        // An empty cache lookup requires the network, so prime the cache
        // directly.
        let server = server();
        server
            .cache
            .write()
            .unwrap()
            .insert("hirsute".into(), Arc::new(vec![leaf("pkg", &["a.c"])]));
        let output = server.handle_query("hirsute", None);
        assert_eq!(400, output.status);
        assert_eq!("400 Bad Request\n", output.body);

        let output = server.handle_query("hirsute", Some("a"));
        assert_eq!(200, output.status);
        assert!(output.body.contains("Warm: true"));
        assert!(output.body.contains("Results: 1"));
    }
}
