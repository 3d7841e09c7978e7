// Copyright 2024 dproxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! A reverse-codepoint wildcard suffix trie.
//!
//! Keys are stored and walked in reverse codepoint order, so that domains
//! sharing a common suffix (`example.com`, `www.example.com`) share trie
//! edges. A key such as `*.example.com` therefore matches `example.com`
//! itself and any of its subdomains, but not `notexample.com`.
//!
//! ```
//! use wildmatch::Trie;
//! let mut t = Trie::new();
//! t.insert("*.example.com", 1u32);
//! assert_eq!(t.find(".example.com"), Some(&1));
//! assert_eq!(t.find(".www.example.com"), Some(&1));
//! assert_eq!(t.find(".notexample.com"), None);
//! ```

use hashbrown::HashMap;

#[derive(Debug)]
struct Node<T> {
    children: HashMap<char, Node<T>>,
    record: Option<T>,
    complete: bool,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            record: None,
            complete: false,
        }
    }
}

/// A wildcard-capable suffix trie, generic over the stored record type.
#[derive(Debug)]
pub struct Trie<T> {
    root: Node<T>,
}

impl<T> Default for Trie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Trie<T> {
    pub fn new() -> Self {
        Self { root: Node::new() }
    }

    /// Insert `record` under `key`, walking `key` in reverse codepoint
    /// order. Overwrites any prior record at the exact same key.
    pub fn insert(&mut self, key: &str, record: T) {
        let mut node = &mut self.root;
        for c in key.chars().rev() {
            node = node.children.entry(c).or_insert_with(Node::new);
        }
        node.record = Some(record);
        node.complete = true;
    }

    /// Clear the record at `key`, if present and complete. Leaves the node
    /// structure in place. Returns whether a record was actually cleared.
    pub fn delete(&mut self, key: &str) -> bool {
        let mut node = &mut self.root;
        for c in key.chars().rev() {
            match node.children.get_mut(&c) {
                Some(next) => node = next,
                None => return false,
            }
        }
        if node.complete {
            node.record = None;
            node.complete = false;
            true
        } else {
            false
        }
    }

    /// Look up `query` (already lookup-normalised: a leading `.` prefixed
    /// to the domain by the caller). Exact matches win over wildcard
    /// matches; see the module docs for the matching rules.
    pub fn find(&self, query: &str) -> Option<&T> {
        let mut node = Some(&self.root);
        let mut pre_split: Option<&Node<T>> = None;

        for c in query.chars().rev() {
            let n = node.expect("node is only None after the loop breaks");
            match n.children.get(&c) {
                Some(next) => {
                    node = Some(next);
                    if c == '.' {
                        pre_split = Some(next);
                    }
                }
                None => {
                    node = None;
                    break;
                }
            }
        }

        if let Some(n) = node {
            if n.complete {
                return n.record.as_ref();
            }
            if let Some(dot) = n.children.get(&'.') {
                pre_split = Some(dot);
            }
        }

        pre_split
            .and_then(|ps| ps.children.get(&'*'))
            .filter(|star| star.complete)
            .and_then(|star| star.record.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::Trie;

    fn wildcard_key(domain: &str) -> String {
        format!("*.{domain}")
    }

    fn lookup_key(domain: &str) -> String {
        format!(".{domain}")
    }

    #[test]
    fn exact_and_subdomain_match() {
        let mut t = Trie::new();
        t.insert(&wildcard_key("example.com"), "example");
        assert_eq!(t.find(&lookup_key("example.com")), Some(&"example"));
        assert_eq!(t.find(&lookup_key("x.example.com")), Some(&"example"));
        assert_eq!(
            t.find(&lookup_key("deep.x.example.com")),
            Some(&"example")
        );
    }

    #[test]
    fn no_boundary_no_match() {
        let mut t = Trie::new();
        t.insert(&wildcard_key("example.com"), "example");
        assert_eq!(t.find(&lookup_key("notexample.com")), None);
    }

    #[test]
    fn delete_removes_match() {
        let mut t = Trie::new();
        t.insert(&wildcard_key("example.com"), "example");
        assert!(t.delete(&wildcard_key("example.com")));
        assert_eq!(t.find(&lookup_key("example.com")), None);
        assert_eq!(t.find(&lookup_key("x.example.com")), None);
    }

    #[test]
    fn delete_missing_key_is_noop() {
        let mut t: Trie<&str> = Trie::new();
        assert!(!t.delete(&wildcard_key("example.com")));
    }

    #[test]
    fn overwrite_keeps_latest_record() {
        let mut t = Trie::new();
        t.insert(&wildcard_key("example.com"), 1);
        t.insert(&wildcard_key("example.com"), 2);
        assert_eq!(t.find(&lookup_key("example.com")), Some(&2));
    }

    #[test]
    fn unrelated_domain_not_found() {
        let mut t: Trie<&str> = Trie::new();
        t.insert(&wildcard_key("example.com"), "example");
        assert_eq!(t.find(&lookup_key("other.test")), None);
    }

    #[test]
    fn longest_suffix_shares_edges_but_most_specific_rule_can_still_be_exact() {
        let mut t = Trie::new();
        t.insert(&wildcard_key("example.com"), "outer");
        t.insert("moc.elpmaxe.vni", "exact-inverted-noop"); // unrelated key, same prefix family
        assert_eq!(t.find(&lookup_key("a.example.com")), Some(&"outer"));
    }
}
