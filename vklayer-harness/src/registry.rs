//! Test registration and name filtering.

use std::collections::HashSet;
use tracing::warn;

use crate::testcase::TestCase;

/// A gtest-style filter: `POS1:POS2-NEG1:NEG2`, with `*` and `?` wildcards.
///
/// An empty positive part selects everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFilter {
    positive: Vec<String>,
    negative: Vec<String>,
}

impl Default for TestFilter {
    fn default() -> Self {
        Self::parse("*")
    }
}

fn patterns(part: &str) -> Vec<String> {
    part.split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

impl TestFilter {
    pub fn parse(expr: &str) -> Self {
        let (positive, negative) = match expr.split_once('-') {
            Some((pos, neg)) => (pos, neg),
            None => (expr, ""),
        };
        let mut positive = patterns(positive);
        if positive.is_empty() {
            positive.push("*".to_string());
        }
        Self {
            positive,
            negative: patterns(negative),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.positive.iter().any(|p| wildcard_match(p, name))
            && !self.negative.iter().any(|p| wildcard_match(p, name))
    }
}

/// Matches `name` against `pattern`, where `*` is any run of characters and
/// `?` is exactly one.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    // Position of the last `*` seen and the name index it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, at)) = backtrack {
            pi = star + 1;
            ni = at + 1;
            backtrack = Some((star, at + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// Every known test, in registration order.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    tests: Vec<TestCase>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `test`; a second test with the same name is dropped.
    pub fn register(&mut self, test: TestCase) {
        if self.tests.iter().any(|t| t.name() == test.name()) {
            warn!("Test {} registered twice; keeping the first", test.name());
            return;
        }
        self.tests.push(test);
    }

    pub fn extend(&mut self, tests: impl IntoIterator<Item = TestCase>) {
        for test in tests {
            self.register(test);
        }
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tests.iter().map(TestCase::name)
    }

    pub fn select<'a>(&'a self, filter: &'a TestFilter) -> impl Iterator<Item = &'a TestCase> + 'a {
        self.tests.iter().filter(move |t| filter.matches(t.name()))
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.name() == name)
    }

    /// Names equal to an earlier one except for case.
    pub fn case_collisions(&self) -> Vec<&'static str> {
        let mut seen = HashSet::new();
        self.names()
            .filter(|name| !seen.insert(name.to_ascii_lowercase()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::testcase::TestContext;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn noop(_: &mut TestContext) -> Result<()> {
        Ok(())
    }

    #[rstest]
    #[case("*", "Anything", true)]
    #[case("", "", true)]
    #[case("Push*", "PushConstantRangeOverlap", true)]
    #[case("Push*", "InvalidPushConstants", false)]
    #[case("*Buffer*", "SecondaryCommandBufferNullRenderpass", true)]
    #[case("Draw?ndexed", "DrawIndexed", true)]
    #[case("Draw?ndexed", "Drawndexed", false)]
    #[case("a*b*c", "axxbyyc", true)]
    #[case("a*b*c", "axxbyy", false)]
    #[case("**", "x", true)]
    fn wildcards(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(wildcard_match(pattern, name), expected);
    }

    #[test]
    fn filter_applies_negatives_after_positives() {
        let filter = TestFilter::parse("Dynamic*:Index*-*Bounds*:IndexBufferNotBound");
        assert!(filter.matches("DynamicViewportNotBound"));
        assert!(filter.matches("IndexBufferBadSize"));
        assert!(!filter.matches("DynamicDepthBoundsNotBound"));
        assert!(!filter.matches("IndexBufferNotBound"));
        assert!(!filter.matches("PushConstantRangeOverlap"));
    }

    #[test]
    fn negative_only_filter_selects_the_rest() {
        let filter = TestFilter::parse("-RayTracing*");
        assert!(filter.matches("ResetEventThenSet"));
        assert!(!filter.matches("RayTracingPipelineNotBound"));
    }

    #[test]
    fn registry_keeps_first_of_duplicates_and_filters() {
        let mut registry = Registry::new();
        registry.extend([
            TestCase::new("Alpha", noop),
            TestCase::new("Beta", noop),
            TestCase::new("Alpha", noop),
            TestCase::new("alpha", noop),
        ]);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.case_collisions(), vec!["alpha"]);
        let filter = TestFilter::parse("B*");
        let selected: Vec<_> = registry.select(&filter).map(TestCase::name).collect();
        assert_eq!(selected, vec!["Beta"]);
        assert!(registry.get("Beta").is_some());
    }
}
