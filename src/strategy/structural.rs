//! Structural search: match an instruction against a DOM snapshot by text,
//! role and attributes.

use std::collections::HashSet;

use crate::browser::{DomNode, ElementAction, Locator};

use super::{similarity, ElementHint, Intent};

/// Attributes that commonly carry an element's accessible name.
const NAME_ATTRIBUTES: &[&str] = &[
    "aria-label",
    "placeholder",
    "title",
    "name",
    "value",
    "alt",
    "id",
];

/// A structural match with its heuristic score.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub locator: Locator,
    pub score: f64,
}

fn is_text_input(node: &DomNode) -> bool {
    let input_type = node.attributes.get("type").map(String::as_str).unwrap_or("text");
    match node.tag.as_str() {
        "textarea" | "select" => true,
        "input" => !matches!(
            input_type,
            "submit" | "button" | "reset" | "checkbox" | "radio" | "image" | "hidden"
        ),
        _ => matches!(node.role.as_deref(), Some("textbox" | "searchbox" | "combobox"))
            || node.attributes.get("contenteditable").map(String::as_str) == Some("true"),
    }
}

fn is_button(node: &DomNode) -> bool {
    node.tag == "button"
        || node.role.as_deref() == Some("button")
        || (node.tag == "input"
            && matches!(
                node.attributes.get("type").map(String::as_str),
                Some("submit" | "button" | "reset" | "image")
            ))
}

fn is_link(node: &DomNode) -> bool {
    node.tag == "a" || node.role.as_deref() == Some("link")
}

fn role_score(node: &DomNode, hint: ElementHint) -> Option<f64> {
    match hint {
        ElementHint::Button if is_button(node) => Some(2.0),
        ElementHint::Link if is_link(node) => Some(2.0),
        ElementHint::TextInput if is_text_input(node) => Some(2.0),
        // Text inputs are the only thing a fill can target.
        ElementHint::TextInput => None,
        ElementHint::Any if is_button(node) || is_link(node) => Some(1.0),
        _ => Some(0.0),
    }
}

fn text_score(node: &DomNode, target: &str) -> f64 {
    let mut names: Vec<&str> = vec![node.text.as_str()];
    if let Some(label) = &node.label {
        names.push(label);
    }
    for attr in NAME_ATTRIBUTES {
        if let Some(value) = node.attributes.get(*attr) {
            names.push(value);
        }
    }

    names
        .into_iter()
        .map(|name| similarity(target, name) * 5.0)
        .fold(0.0, f64::max)
}

/// Rank snapshot nodes for the intent. The author's selector hint, when
/// present, is always the first candidate.
pub fn rank_candidates(
    intent: &Intent,
    action: &ElementAction,
    nodes: &[DomNode],
    limit: usize,
) -> Vec<Candidate> {
    let hint = match action {
        ElementAction::Fill(_) => ElementHint::TextInput,
        ElementAction::Click => intent.hint,
    };

    let mut ranked: Vec<Candidate> = Vec::new();
    if let Some(selector) = &intent.selector_hint {
        ranked.push(Candidate {
            locator: Locator::css(selector.clone()),
            score: f64::INFINITY,
        });
    }

    if !intent.target.is_empty() {
        let mut scored: Vec<Candidate> = nodes
            .iter()
            .filter(|node| node.visible && !node.selector.is_empty())
            .filter_map(|node| {
                let role = role_score(node, hint)?;
                let text = text_score(node, &intent.target);
                // Role alone never identifies an element.
                (text >= 2.5).then(|| Candidate {
                    locator: Locator::css(node.selector.clone()),
                    score: text + role,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.extend(scored);
    }

    let mut seen = HashSet::new();
    ranked.retain(|candidate| seen.insert(candidate.locator.to_string()));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(tag: &str, text: &str, selector: &str, attrs: &[(&str, &str)]) -> DomNode {
        DomNode {
            tag: tag.into(),
            role: None,
            text: text.into(),
            label: None,
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            selector: selector.into(),
            visible: true,
        }
    }

    fn page() -> Vec<DomNode> {
        vec![
            node("a", "Sign in help", "a.help", &[]),
            node("button", "Sign in", "#login-btn", &[]),
            node("div", "Welcome back! Sign in to continue", "div.hero", &[]),
            node("input", "", "#email", &[("type", "email"), ("placeholder", "Email address")]),
            node("input", "", "#go", &[("type", "submit"), ("value", "Search")]),
        ]
    }

    #[test]
    fn test_button_preferred_for_button_instruction() {
        let intent = Intent::parse("Click the Sign in button", None);
        let ranked = rank_candidates(&intent, &ElementAction::Click, &page(), 3);
        assert_eq!(ranked[0].locator, Locator::css("#login-btn"));
    }

    #[test]
    fn test_fill_only_targets_inputs() {
        let intent = Intent::parse("Fill the email address field", None);
        let ranked = rank_candidates(&intent, &ElementAction::Fill("a@b.com".into()), &page(), 3);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].locator, Locator::css("#email"));
    }

    #[test]
    fn test_selector_hint_goes_first() {
        let intent = Intent::parse("Click Search", Some("form > #go"));
        let ranked = rank_candidates(&intent, &ElementAction::Click, &page(), 3);
        assert_eq!(ranked[0].locator, Locator::css("form > #go"));
        assert_eq!(ranked[1].locator, Locator::css("#go"));
    }

    #[test]
    fn test_hinted_selector_is_tried_once() {
        let intent = Intent::parse("Click the Sign in button", Some("a.help"));
        let ranked = rank_candidates(&intent, &ElementAction::Click, &page(), 3);
        let locators: Vec<_> = ranked.into_iter().map(|c| c.locator).collect();
        assert_eq!(
            locators,
            vec![
                Locator::css("a.help"),
                Locator::css("#login-btn"),
                Locator::css("div.hero"),
            ]
        );
    }

    #[test]
    fn test_no_match_yields_nothing() {
        let intent = Intent::parse("Click the Checkout button", None);
        assert!(rank_candidates(&intent, &ElementAction::Click, &page(), 3).is_empty());
    }

    #[test]
    fn test_invisible_nodes_are_ignored() {
        let mut nodes = page();
        for n in nodes.iter_mut() {
            n.visible = false;
        }
        let intent = Intent::parse("Click the Sign in button", None);
        assert!(rank_candidates(&intent, &ElementAction::Click, &nodes, 3).is_empty());
    }
}
