//! Path-query policy
//!
//! A policy declares the expected hop topology and, for flows matching a
//! 5-tuple pattern, hop chains the collector should watch for.
//!
//! ```text
//! 1 -> 2
//! 2 -> 3
//! (10.0.0.0/8, 10.1.0.1, 17, 0, 53): 1 -> 2 -> 3
//! ```
//!
//! Every connection comes before the first check. A flow pattern lists
//! source prefix, destination prefix, protocol, source port and
//! destination port; a protocol or port of 0 matches anything.

use crate::types::{EdgeId, EdgeRecord, QueryMatch};
use anyhow::{bail, Context, Result};
use flowtrace_common::{constants::ORIGIN_HOP_ID, FlowKey};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

/// IPv4 prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub addr: u32,
    pub mask: u32,
}

impl Prefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Self {
        let mask = if len == 0 { 0 } else { u32::MAX << (32 - len.min(32) as u32) };
        Self {
            addr: u32::from(addr) & mask,
            mask,
        }
    }

    pub fn matches(&self, addr: u32) -> bool {
        addr & self.mask == self.addr
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.addr), self.mask.count_ones())
    }
}

/// 5-tuple pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub src: Prefix,
    pub dst: Prefix,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowMatch {
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.src.matches(key.src_addr)
            && self.dst.matches(key.dst_addr)
            && (self.protocol == 0 || self.protocol == key.protocol)
            && (self.src_port == 0 || self.src_port == key.src_port)
            && (self.dst_port == 0 || self.dst_port == key.dst_port)
    }
}

/// Hop chains watched for flows matching one pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    pub flow: FlowMatch,
    /// Chains in declaration order, first hop first
    pub chains: Vec<Vec<u32>>,
}

/// Parsed policy file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Declared topology: hop to its expected successors
    pub connections: BTreeMap<u32, BTreeSet<u32>>,
    /// Queries in declaration order; checks on the same pattern are merged
    pub queries: Vec<PathQuery>,
}

impl Policy {
    /// Read and parse a policy file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {:?}", path))?;
        let policy: Policy = text
            .parse()
            .with_context(|| format!("Failed to parse policy file {:?}", path))?;

        info!(
            "Loaded policy from {:?}: {} connections, {} queries",
            path,
            policy.connection_count(),
            policy.queries.len()
        );
        Ok(policy)
    }

    /// Whether `edge` is part of the declared topology
    ///
    /// Edges leaving the sampler are always expected, as is everything
    /// when no topology is declared.
    pub fn is_expected(&self, edge: EdgeId) -> bool {
        self.connections.is_empty()
            || edge.from == ORIGIN_HOP_ID as u32
            || self
                .connections
                .get(&edge.from)
                .is_some_and(|next| next.contains(&edge.to))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.values().map(BTreeSet::len).sum()
    }

    fn add_check(&mut self, flow: FlowMatch, chain: Vec<u32>) {
        match self.queries.iter_mut().find(|q| q.flow == flow) {
            Some(query) => query.chains.push(chain),
            None => self.queries.push(PathQuery {
                flow,
                chains: vec![chain],
            }),
        }
    }
}

impl FromStr for Policy {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        PolicyParser::new(text).parse()
    }
}

/// Recursive-descent parser over the policy text
struct PolicyParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> PolicyParser<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn parse(mut self) -> Result<Policy> {
        let mut policy = Policy::default();

        self.skip_ws();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            let from = self.hop()?;
            self.arrow()?;
            let to = self.hop()?;
            policy.connections.entry(from).or_default().insert(to);
            self.skip_ws();
        }
        if policy.connections.is_empty() {
            bail!("{}: expected at least one connection `a -> b`", self.location());
        }

        while self.peek() == Some('(') {
            let flow = self.flow()?;
            self.skip_ws();
            self.expect(':')?;
            let chain = self.chain()?;
            policy.add_check(flow, chain);
            self.skip_ws();
        }
        if policy.queries.is_empty() {
            bail!("{}: expected at least one check `(flow): chain`", self.location());
        }

        if self.peek().is_some() {
            bail!("{}: unexpected input", self.location());
        }

        Ok(policy)
    }

    fn chain(&mut self) -> Result<Vec<u32>> {
        let mut chain = vec![self.hop()?];
        loop {
            let mark = self.pos;
            self.skip_ws();
            if self.text[self.pos..].starts_with("->") {
                self.arrow()?;
                chain.push(self.hop()?);
            } else {
                self.pos = mark;
                return Ok(chain);
            }
        }
    }

    fn flow(&mut self) -> Result<FlowMatch> {
        self.expect('(')?;
        let src = self.prefix()?;
        self.delim()?;
        let dst = self.prefix()?;
        self.delim()?;
        let protocol = self.number::<u8>("protocol")?;
        self.delim()?;
        let src_port = self.number::<u16>("source port")?;
        self.delim()?;
        let dst_port = self.number::<u16>("destination port")?;
        self.skip_ws();
        self.expect(')')?;

        Ok(FlowMatch {
            src,
            dst,
            protocol,
            src_port,
            dst_port,
        })
    }

    fn prefix(&mut self) -> Result<Prefix> {
        self.skip_ws();
        let at = self.location();
        let token = self.take_while(|c| c.is_ascii_digit() || c == '.' || c == '/');
        let (addr, len) = match token.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u8>().ok().filter(|l| *l <= 32)),
            None => (token, Some(32)),
        };
        let addr = addr
            .parse::<Ipv4Addr>()
            .with_context(|| format!("{}: invalid address {:?}", at, token))?;
        let len = len.with_context(|| format!("{}: invalid prefix length in {:?}", at, token))?;
        Ok(Prefix::new(addr, len))
    }

    fn hop(&mut self) -> Result<u32> {
        self.number::<u32>("hop id")
    }

    fn number<T: FromStr>(&mut self, what: &str) -> Result<T> {
        self.skip_ws();
        let at = self.location();
        let token = self.take_while(|c| c.is_ascii_digit());
        match token.parse::<T>() {
            Ok(value) => Ok(value),
            Err(_) => bail!("{}: expected {}, found {:?}", at, what, self.rest_of_token(token)),
        }
    }

    fn arrow(&mut self) -> Result<()> {
        self.skip_ws();
        if self.text[self.pos..].starts_with("->") {
            self.pos += 2;
            Ok(())
        } else {
            bail!("{}: expected `->`", self.location())
        }
    }

    fn delim(&mut self) -> Result<()> {
        self.skip_ws();
        self.expect(',')
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            bail!("{}: expected `{}`", self.location(), c)
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn skip_ws(&mut self) {
        self.take_while(char::is_whitespace);
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        let rest = &self.text[start..];
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        self.pos += len;
        &self.text[start..start + len]
    }

    fn rest_of_token(&self, token: &'a str) -> String {
        if token.is_empty() {
            self.peek().map(String::from).unwrap_or_else(|| "end of input".to_string())
        } else {
            token.to_string()
        }
    }

    /// Current position as `line:column`
    fn location(&self) -> String {
        let before = &self.text[..self.pos];
        let line = before.matches('\n').count() + 1;
        let column = before.len() - before.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
        format!("line {}:{}", line, column)
    }
}

/// Tracks the edges each flow has traversed and evaluates path queries
#[derive(Debug, Default)]
pub struct PathAnalyzer {
    policy: Policy,
    observed: HashMap<FlowKey, HashSet<EdgeId>>,
    /// (flow, query index, chain index) already reported
    satisfied: HashSet<(FlowKey, usize, usize)>,
    matches: Vec<QueryMatch>,
    unexpected: BTreeSet<EdgeId>,
}

impl PathAnalyzer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Record one row
    ///
    /// # Returns
    ///
    /// Queries this row completed
    pub fn observe(&mut self, row: &EdgeRecord) -> Vec<QueryMatch> {
        let key = row.flow_key();
        let edge = row.edge();

        if !self.policy.is_expected(edge) && self.unexpected.insert(edge) {
            warn!("Unexpected edge {} observed for flow {}", edge, key);
        }

        let edges = self.observed.entry(key).or_default();
        edges.insert(edge);

        let Some((query_idx, query)) = self
            .policy
            .queries
            .iter()
            .enumerate()
            .find(|(_, q)| q.flow.matches(&key))
        else {
            return Vec::new();
        };

        let mut completed = Vec::new();
        for (chain_idx, chain) in query.chains.iter().enumerate() {
            if self.satisfied.contains(&(key, query_idx, chain_idx)) {
                continue;
            }

            let traversed = match chain.as_slice() {
                [hop] => edges.iter().any(|e| e.to == *hop),
                _ => chain.windows(2).all(|pair| {
                    edges.contains(&EdgeId {
                        from: pair[0],
                        to: pair[1],
                    })
                }),
            };

            if traversed {
                self.satisfied.insert((key, query_idx, chain_idx));
                let matched = QueryMatch {
                    flow: key.to_string(),
                    path: chain.clone(),
                    timestamp: row.timestamp,
                };
                debug!("Flow {} matched path {:?} @ t = {}", key, chain, row.timestamp);
                completed.push(matched);
            }
        }

        self.matches.extend(completed.iter().cloned());
        completed
    }

    pub fn matches(&self) -> &[QueryMatch] {
        &self.matches
    }

    pub fn unexpected_edges(&self) -> Vec<EdgeId> {
        self.unexpected.iter().copied().collect()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Edges observed for `key`
    pub fn edges_for(&self, key: &FlowKey) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = self
            .observed
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        edges.sort();
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "
        1 -> 2
        2 -> 3

        (10.0.0.0/8, 192.168.1.1, 17, 0, 53): 1 -> 2 -> 3
        (10.0.0.0/8, 192.168.1.1, 17, 0, 53): 2
        (0.0.0.0/0, 0.0.0.0/0, 0, 0, 0): 1 -> 2
    ";

    fn row(src: [u8; 4], dst: [u8; 4], dport: u16, from: u32, to: u32, t: f64) -> EdgeRecord {
        EdgeRecord {
            prev_hop_id: from,
            this_hop_id: to,
            src_ip: Ipv4Addr::from(src),
            dst_ip: Ipv4Addr::from(dst),
            src_port: 4000,
            dst_port: dport,
            protocol: 17,
            timestamp: t,
        }
    }

    #[test]
    fn test_parse_policy() {
        let policy: Policy = POLICY.parse().unwrap();

        assert_eq!(policy.connection_count(), 2);
        assert!(policy.connections[&1].contains(&2));
        assert_eq!(policy.queries.len(), 2);

        let first = &policy.queries[0];
        assert_eq!(first.flow.src, Prefix::new(Ipv4Addr::new(10, 0, 0, 0), 8));
        assert_eq!(first.flow.dst.mask, u32::MAX);
        assert_eq!(first.flow.protocol, 17);
        assert_eq!(first.flow.dst_port, 53);
        assert_eq!(first.chains, vec![vec![1, 2, 3], vec![2]]);
    }

    #[test]
    fn test_parse_errors() {
        assert!("(1.2.3.4, 1.2.3.4, 6, 0, 0): 1".parse::<Policy>().is_err());
        assert!("1 -> 2".parse::<Policy>().is_err());
        assert!("1 -> 2 (1.2.3.4/33, 1.2.3.4, 6, 0, 0): 1".parse::<Policy>().is_err());
        assert!("1 -> 2 (1.2.3.4, 1.2.3.4, 6, 0): 1".parse::<Policy>().is_err());

        let err = "1 -> 2\n(1.2.3, 1.2.3.4, 6, 0, 0): 1".parse::<Policy>().unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn test_flow_match_wildcards() {
        let flow = FlowMatch {
            src: Prefix::new(Ipv4Addr::new(10, 1, 2, 3), 16),
            dst: Prefix::new(Ipv4Addr::UNSPECIFIED, 0),
            protocol: 0,
            src_port: 0,
            dst_port: 443,
        };

        assert!(flow.matches(&FlowKey::new(0x0a01_ffff, 1, 5, 443, 6)));
        assert!(!flow.matches(&FlowKey::new(0x0a02_0001, 1, 5, 443, 6)));
        assert!(!flow.matches(&FlowKey::new(0x0a01_0001, 1, 5, 80, 6)));
    }

    #[test]
    fn test_chain_matches_once_when_complete() {
        let mut analyzer = PathAnalyzer::new(POLICY.parse().unwrap());
        let (src, dst) = ([10, 0, 0, 5], [192, 168, 1, 1]);

        assert!(analyzer.observe(&row(src, dst, 53, 0, 1, 1.0)).is_empty());

        let matched = analyzer.observe(&row(src, dst, 53, 1, 2, 1.1));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].path, vec![2]);

        let matched = analyzer.observe(&row(src, dst, 53, 2, 3, 1.2));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].path, vec![1, 2, 3]);
        assert_eq!(matched[0].timestamp, 1.2);

        assert!(analyzer.observe(&row(src, dst, 53, 2, 3, 1.3)).is_empty());
        assert_eq!(analyzer.matches().len(), 2);
    }

    #[test]
    fn test_first_matching_query_wins() {
        let mut analyzer = PathAnalyzer::new(POLICY.parse().unwrap());
        let (src, dst) = ([10, 0, 0, 5], [192, 168, 1, 1]);

        // Matches the first pattern, so the catch-all 1 -> 2 is not evaluated
        let matched = analyzer.observe(&row(src, dst, 53, 1, 2, 0.5));
        assert!(matched.iter().all(|m| m.path != vec![1, 2]));

        let other = analyzer.observe(&row([172, 16, 0, 1], dst, 80, 1, 2, 0.6));
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].path, vec![1, 2]);
    }

    #[test]
    fn test_unexpected_edges() {
        let mut analyzer = PathAnalyzer::new(POLICY.parse().unwrap());
        let (src, dst) = ([10, 0, 0, 5], [192, 168, 1, 1]);

        analyzer.observe(&row(src, dst, 53, 0, 1, 0.0));
        analyzer.observe(&row(src, dst, 53, 1, 3, 0.1));
        analyzer.observe(&row(src, dst, 53, 1, 3, 0.2));

        assert_eq!(analyzer.unexpected_edges(), vec![EdgeId { from: 1, to: 3 }]);
        assert_eq!(
            analyzer.edges_for(&row(src, dst, 53, 0, 0, 0.0).flow_key()),
            vec![EdgeId { from: 0, to: 1 }, EdgeId { from: 1, to: 3 }]
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paths.policy");
        std::fs::write(&path, POLICY).unwrap();

        let policy = Policy::load(&path).unwrap();
        assert_eq!(policy.queries.len(), 2);
        assert!(Policy::load(dir.path().join("missing")).is_err());
    }
}
