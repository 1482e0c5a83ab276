//! Static communication graph
//!
//! The topology is an undirected edge list over integer agent tokens,
//! loaded once at startup and never changed for the lifetime of a run.
//!
//! File format: one edge per line, two whitespace-separated non-negative
//! integers. Lines with any other number of fields are skipped, as are
//! blank lines and `#` comments.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// Agent identifier
pub type Token = u32;

/// Undirected graph over agent tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    adjacency: BTreeMap<Token, BTreeSet<Token>>,
    edges: usize,
}

impl Topology {
    /// Load and parse a topology file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ConfigNotFound {
                path: path.to_path_buf(),
            },
            _ => Error::IoRead {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Self::parse(&text)
    }

    /// Parse an edge list
    pub fn parse(text: &str) -> Result<Self> {
        let mut edges = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() != 2 {
                debug!(line = line_no, fields = fields.len(), "Skipping topology line");
                continue;
            }

            let u = parse_token(fields[0], line_no)?;
            let v = parse_token(fields[1], line_no)?;
            if u == v {
                return Err(Error::topology(
                    line_no,
                    format!("self-loop on token {}", u),
                ));
            }
            edges.push((u, v));
        }

        Self::from_edges(edges)
    }

    /// Build a topology from explicit edges
    pub fn from_edges(edges: impl IntoIterator<Item = (Token, Token)>) -> Result<Self> {
        let mut adjacency: BTreeMap<Token, BTreeSet<Token>> = BTreeMap::new();
        let mut count = 0;

        for (u, v) in edges {
            if u == v {
                return Err(Error::topology(0, format!("self-loop on token {}", u)));
            }
            if adjacency.entry(u).or_default().insert(v) {
                count += 1;
            }
            adjacency.entry(v).or_default().insert(u);
        }

        if count == 0 {
            return Err(Error::topology(0, "topology has no edges"));
        }

        Ok(Self {
            adjacency,
            edges: count,
        })
    }

    /// Neighbors of `token`
    pub fn neighbors(&self, token: Token) -> Result<&BTreeSet<Token>> {
        self.adjacency
            .get(&token)
            .ok_or(Error::UnknownToken { token })
    }

    /// Number of neighbors; zero for tokens outside the graph
    pub fn degree(&self, token: Token) -> usize {
        self.adjacency.get(&token).map_or(0, BTreeSet::len)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.adjacency.contains_key(&token)
    }

    /// All tokens, in ascending order
    pub fn agents(&self) -> impl Iterator<Item = Token> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn agent_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Number of distinct undirected edges
    pub fn edge_count(&self) -> usize {
        self.edges
    }

    /// Whether every agent can reach every other agent
    pub fn is_connected(&self) -> bool {
        let Some(&start) = self.adjacency.keys().next() else {
            return true;
        };

        let mut seen = BTreeSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(token) = queue.pop_front() {
            for &next in &self.adjacency[&token] {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        seen.len() == self.adjacency.len()
    }
}

fn parse_token(field: &str, line: usize) -> Result<Token> {
    match field.parse::<i64>() {
        Ok(n) if n < 0 => Err(Error::topology(line, format!("negative token {}", n))),
        Ok(n) => Token::try_from(n)
            .map_err(|_| Error::topology(line, format!("token {} out of range", n))),
        Err(_) => Err(Error::topology(
            line,
            format!("token '{}' is not an integer", field),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
