//! peerlab-query — label selection for clusters, nodes and records.
//!
//! Every addressable entity carries an ordered set of free-form string
//! labels. A query is a boolean expression over those labels:
//!
//! ```text
//! region=us-west-2 and not (role=seed or canary)
//! region in (us-west-2, us-east-1) & instance_type=t2.micro
//! ```
//!
//! - a bare label tests for its presence
//! - `key in (a, b)` tests for any of `key=a`, `key=b`
//! - `not` / `and` / `or` (or `!` / `&` / `|`), loosest to tightest `or`,
//!   `and`, `not`, with parentheses for grouping
//! - an empty query matches everything
//!
//! Evaluation is a pure per-entity predicate, so the matched set never
//! depends on the order entities are supplied in.

pub mod error;
mod parser;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

pub use error::SyntaxError;
pub use parser::parse;

/// Anything addressable by the query engine.
pub trait Labeled {
    fn id(&self) -> &str;
    fn labels(&self) -> &[String];
}

/// A parsed label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Matches every entity.
    All,
    /// The entity carries this exact label.
    Label(String),
    /// The entity carries `key=value` for at least one of `values`.
    In { key: String, values: Vec<String> },
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
}

impl Query {
    /// Evaluate against one label set. Absent labels are simply false.
    pub fn matches(&self, labels: &[String]) -> bool {
        match self {
            Query::All => true,
            Query::Label(label) => labels.iter().any(|l| l == label),
            Query::In { key, values } => values.iter().any(|value| {
                labels
                    .iter()
                    .any(|l| l.split_once('=') == Some((key.as_str(), value.as_str())))
            }),
            Query::Not(inner) => !inner.matches(labels),
            Query::And(terms) => terms.iter().all(|t| t.matches(labels)),
            Query::Or(terms) => terms.iter().any(|t| t.matches(labels)),
        }
    }

    /// Evaluate over a set of entities.
    pub fn execute<'a, L, I>(&self, entities: I) -> MatchedSet
    where
        L: Labeled + ?Sized + 'a,
        I: IntoIterator<Item = &'a L>,
    {
        let ids = entities
            .into_iter()
            .filter(|e| self.matches(e.labels()))
            .map(|e| e.id().to_string())
            .collect();
        MatchedSet { ids }
    }

    /// Entities that match, in the order they were supplied.
    pub fn filter<'a, L: Labeled>(&self, entities: &'a [L]) -> Vec<&'a L> {
        entities.iter().filter(|e| self.matches(e.labels())).collect()
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Query::All)
    }
}

/// Parse `text` and evaluate it over `entities` in one step.
pub fn execute<'a, L, I>(entities: I, text: &str) -> Result<MatchedSet, SyntaxError>
where
    L: Labeled + ?Sized + 'a,
    I: IntoIterator<Item = &'a L>,
{
    Ok(parse(text)?.execute(entities))
}

impl FromStr for Query {
    type Err = SyntaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

fn write_label(f: &mut fmt::Formatter<'_>, label: &str) -> fmt::Result {
    let bare = !label.is_empty()
        && label.chars().all(parser::is_word_char)
        && !parser::is_keyword(label);
    if bare {
        return f.write_str(label);
    }
    let quote = if label.contains('\'') && !label.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(label.len() + 2);
    out.push(quote);
    for c in label.chars() {
        if c == quote || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push(quote);
    f.write_str(&out)
}

fn write_operand(f: &mut fmt::Formatter<'_>, q: &Query) -> fmt::Result {
    match q {
        Query::And(_) | Query::Or(_) => write!(f, "({q})"),
        _ => write!(f, "{q}"),
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::All => Ok(()),
            Query::Label(label) => write_label(f, label),
            Query::In { key, values } => {
                write_label(f, key)?;
                f.write_str(" in (")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_label(f, value)?;
                }
                f.write_str(")")
            }
            Query::Not(inner) => {
                f.write_str("not ")?;
                write_operand(f, inner)
            }
            Query::And(terms) | Query::Or(terms) => {
                let op = if matches!(self, Query::And(_)) { " and " } else { " or " };
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        f.write_str(op)?;
                    }
                    write_operand(f, term)?;
                }
                Ok(())
            }
        }
    }
}

/// Ids of the entities a query matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedSet {
    ids: BTreeSet<String>,
}

impl MatchedSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Matched ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entity {
        id: String,
        labels: Vec<String>,
    }

    impl Labeled for Entity {
        fn id(&self) -> &str {
            &self.id
        }

        fn labels(&self) -> &[String] {
            &self.labels
        }
    }

    fn entity(id: &str, labels: &[&str]) -> Entity {
        Entity {
            id: id.to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn fleet() -> Vec<Entity> {
        vec![
            entity("a", &["region=us-west-2", "role=seed"]),
            entity("b", &["region=us-west-2", "instance_type=t2.micro"]),
            entity("c", &["region=us-east-1", "instance_type=t2.micro"]),
            entity("d", &["region=eu-west-1", "canary"]),
        ]
    }

    fn matched(entities: &[Entity], q: &str) -> Vec<String> {
        execute(entities, q)
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn label_existence_selects_exact_match() {
        let entities = vec![
            entity("with", &["region=us-west-2"]),
            entity("without", &["region=us-east-1"]),
        ];
        let set = execute(&entities, "region=us-west-2").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("with"));
        assert!(!set.contains("without"));
    }

    #[test]
    fn empty_query_matches_everything() {
        assert_eq!(matched(&fleet(), ""), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn boolean_combinators() {
        let f = fleet();
        assert_eq!(matched(&f, "region=us-west-2 and not role=seed"), vec!["b"]);
        assert_eq!(matched(&f, "canary or role=seed"), vec!["a", "d"]);
        assert_eq!(
            matched(&f, "instance_type=t2.micro and (region=us-east-1 or role=seed)"),
            vec!["c"]
        );
        assert_eq!(matched(&f, "not region=us-west-2"), vec!["c", "d"]);
    }

    #[test]
    fn set_membership_checks_key_value_labels() {
        let f = fleet();
        assert_eq!(
            matched(&f, "region in (us-east-1, eu-west-1)"),
            vec!["c", "d"]
        );
        assert!(matched(&f, "region in (ap-south-1)").is_empty());
    }

    #[test]
    fn unknown_labels_default_to_absent() {
        assert!(matched(&fleet(), "gpu").is_empty());
        assert_eq!(matched(&fleet(), "not gpu").len(), 4);
    }

    #[test]
    fn matched_set_is_order_independent() {
        let queries = [
            "",
            "region=us-west-2",
            "instance_type=t2.micro or canary",
            "not (role=seed and region=us-west-2)",
            "region in (us-west-2, eu-west-1) and not canary",
        ];

        // Heap's algorithm over every ordering of the fleet.
        fn permutations(n: usize, order: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if n == 1 {
                out.push(order.clone());
                return;
            }
            permutations(n - 1, order, out);
            for i in 0..n - 1 {
                let j = if n % 2 == 0 { i } else { 0 };
                order.swap(j, n - 1);
                permutations(n - 1, order, out);
            }
        }
        let mut orders = Vec::new();
        permutations(4, &mut (0..4).collect(), &mut orders);
        assert_eq!(orders.len(), 24);

        for q in queries {
            let query = parse(q).unwrap();
            let reference = query.execute(&fleet());
            for order in &orders {
                let f = fleet();
                let shuffled: Vec<&Entity> = order.iter().map(|&i| &f[i]).collect();
                assert_eq!(query.execute(shuffled.into_iter()), reference, "query {q:?}");
            }
        }
    }

    #[test]
    fn filter_preserves_input_order() {
        let f = fleet();
        let q = parse("instance_type=t2.micro").unwrap();
        let ids: Vec<&str> = q.filter(&f).iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn display_is_reparsable() {
        let sources = [
            "a and (b or c)",
            "not (a and b) or c",
            "(a and b) and c",
            "region in (us-west-2, 'eu west') and not 'and'",
            "\"it's\" or plain",
            r#"'both \' and "' and plain"#,
            r"'c:\dir' or 'x\\y'",
        ];
        for src in sources {
            let q = parse(src).unwrap();
            let reparsed = parse(&q.to_string()).unwrap();
            assert_eq!(q, reparsed, "{src:?} rendered as {q}");
        }
    }

    #[test]
    fn label_with_both_quotes_renders_escaped() {
        let q = Query::Label(r#"say "it's""#.to_string());
        assert_eq!(q.to_string(), r#"'say "it\'s"'"#);
        assert_eq!(parse(&q.to_string()).unwrap(), q);

        let q = Query::Label(r"back\slash".to_string());
        assert_eq!(parse(&q.to_string()).unwrap(), q);
    }

    #[test]
    fn syntax_errors_surface() {
        let err = execute(&fleet(), "a and or b").unwrap_err();
        assert_eq!(err.position, 6);
    }
}
