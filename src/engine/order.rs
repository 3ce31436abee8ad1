//! Evaluation order of assertions within a group.

use crate::config::Assertion;
use std::collections::BTreeMap;

/// Assertions sorted by `order` ascending, ties broken by name ascending.
///
/// Name order alone is never relied on; `order` always wins.
pub fn sorted(assertions: &BTreeMap<String, Assertion>) -> Vec<(&str, &Assertion)> {
    let mut out: Vec<(&str, &Assertion)> = assertions
        .iter()
        .map(|(name, assertion)| (name.as_str(), assertion))
        .collect();
    out.sort_by(|(a_name, a), (b_name, b)| {
        a.effective_order()
            .cmp(&b.effective_order())
            .then_with(|| a_name.cmp(b_name))
    });
    out
}
