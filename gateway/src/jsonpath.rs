//! A small JSONPath evaluator for `$input.path(...)` and `$input.json(...)`.
//!
//! Supported: `$`, `.name`, `['name']`, `["name"]`, `[0]`, `[-1]`, `.*`, `[*]` and recursive
//! descent (`..name`, `..*`, `..[0]`). The leading `$` may be omitted.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Selector {
    Member(String),
    Index(i64),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    recursive: bool,
    selector: Selector,
}

/// The first node `expression` selects in `document`, in document order.
///
/// Malformed expressions and expressions that select nothing both return `None`.
pub fn extract(document: &Value, expression: &str) -> Option<Value> {
    let steps = parse(expression)?;
    let mut current = vec![document];
    for step in &steps {
        let mut next = Vec::new();
        if step.recursive {
            let mut nodes = Vec::new();
            descendants(&current, &mut nodes);
            for node in nodes {
                select(node, &step.selector, &mut next);
            }
        } else {
            for node in current {
                select(node, &step.selector, &mut next);
            }
        }
        if next.is_empty() {
            return None;
        }
        current = next;
    }
    current.first().map(|v| (*v).clone())
}

fn descendants<'a>(nodes: &[&'a Value], out: &mut Vec<&'a Value>) {
    for &node in nodes {
        out.push(node);
        match node {
            Value::Object(map) => descendants(&map.values().collect::<Vec<_>>(), out),
            Value::Array(items) => descendants(&items.iter().collect::<Vec<_>>(), out),
            _ => {}
        }
    }
}

fn select<'a>(node: &'a Value, selector: &Selector, out: &mut Vec<&'a Value>) {
    match (selector, node) {
        (Selector::Member(name), Value::Object(map)) => out.extend(map.get(name)),
        (Selector::Index(idx), Value::Array(items)) => {
            let idx = if *idx < 0 {
                items.len() as i64 + idx
            } else {
                *idx
            };
            if let Ok(idx) = usize::try_from(idx) {
                out.extend(items.get(idx));
            }
        }
        (Selector::Wildcard, Value::Object(map)) => out.extend(map.values()),
        (Selector::Wildcard, Value::Array(items)) => out.extend(items.iter()),
        _ => {}
    }
}

fn parse(expression: &str) -> Option<Vec<Step>> {
    let chars: Vec<char> = expression.trim().chars().collect();
    let mut pos = 0;
    let mut steps = Vec::new();

    if chars.first() == Some(&'$') {
        pos = 1;
    } else if chars.first().is_some_and(|c| is_name_char(*c)) {
        // `a.b` is shorthand for `$.a.b`.
        let name = read_name(&chars, &mut pos);
        steps.push(Step {
            recursive: false,
            selector: Selector::Member(name),
        });
    }

    while pos < chars.len() {
        match chars[pos] {
            '.' => {
                let recursive = chars.get(pos + 1) == Some(&'.');
                pos += if recursive { 2 } else { 1 };
                match chars.get(pos) {
                    Some('*') => {
                        pos += 1;
                        steps.push(Step {
                            recursive,
                            selector: Selector::Wildcard,
                        });
                    }
                    Some('[') if recursive => {
                        pos += 1;
                        let selector = parse_bracket(&chars, &mut pos)?;
                        steps.push(Step {
                            recursive,
                            selector,
                        });
                    }
                    Some(c) if is_name_char(*c) => {
                        let name = read_name(&chars, &mut pos);
                        steps.push(Step {
                            recursive,
                            selector: Selector::Member(name),
                        });
                    }
                    _ => return None,
                }
            }
            '[' => {
                pos += 1;
                let selector = parse_bracket(&chars, &mut pos)?;
                steps.push(Step {
                    recursive: false,
                    selector,
                });
            }
            _ => return None,
        }
    }
    Some(steps)
}

/// Parse the inside of `[...]`; `pos` is just past the `[` and ends just past the `]`.
fn parse_bracket(chars: &[char], pos: &mut usize) -> Option<Selector> {
    skip_spaces(chars, pos);
    let selector = match chars.get(*pos)? {
        '*' => {
            *pos += 1;
            Selector::Wildcard
        }
        quote @ ('\'' | '"') => {
            let quote = *quote;
            *pos += 1;
            let mut name = String::new();
            loop {
                match chars.get(*pos)? {
                    '\\' => {
                        name.push(*chars.get(*pos + 1)?);
                        *pos += 2;
                    }
                    c if *c == quote => {
                        *pos += 1;
                        break;
                    }
                    c => {
                        name.push(*c);
                        *pos += 1;
                    }
                }
            }
            Selector::Member(name)
        }
        _ => {
            let start = *pos;
            if chars.get(*pos) == Some(&'-') {
                *pos += 1;
            }
            while chars.get(*pos).is_some_and(|c| c.is_ascii_digit()) {
                *pos += 1;
            }
            let digits: String = chars[start..*pos].iter().collect();
            Selector::Index(digits.parse().ok()?)
        }
    };
    skip_spaces(chars, pos);
    if chars.get(*pos) != Some(&']') {
        return None;
    }
    *pos += 1;
    Some(selector)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$' || c == '@'
}

fn read_name(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while chars.get(*pos).is_some_and(|c| is_name_char(*c)) {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn skip_spaces(chars: &[char], pos: &mut usize) {
    while chars.get(*pos).is_some_and(|c| c.is_whitespace()) {
        *pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc() -> Value {
        json!({
            "store": {
                "book": [
                    {"title": "A", "price": 8},
                    {"title": "B", "price": 12, "isbn": "x-1"}
                ],
                "bicycle": {"color": "red"}
            },
            "weird key": true
        })
    }

    #[test]
    fn root_selects_the_whole_document() {
        assert_eq!(extract(&doc(), "$"), Some(doc()));
    }

    #[test]
    fn members_and_indices() {
        let d = doc();
        assert_eq!(extract(&d, "$.store.book[1].title"), Some(json!("B")));
        assert_eq!(extract(&d, "$['store']['bicycle'].color"), Some(json!("red")));
        assert_eq!(extract(&d, "$.store.book[-1].price"), Some(json!(12)));
        assert_eq!(extract(&d, "$[\"weird key\"]"), Some(json!(true)));
        assert_eq!(extract(&d, "store.bicycle.color"), Some(json!("red")));
    }

    #[test]
    fn wildcards_return_the_first_match() {
        let d = doc();
        assert_eq!(extract(&d, "$.store.book[*].title"), Some(json!("A")));
        assert_eq!(extract(&d, "$.store.book.*.price"), Some(json!(8)));
    }

    #[test]
    fn recursive_descent_finds_nested_members() {
        let d = doc();
        assert_eq!(extract(&d, "$..isbn"), Some(json!("x-1")));
        assert_eq!(extract(&d, "$..color"), Some(json!("red")));
        assert_eq!(extract(&d, "$..book[0].title"), Some(json!("A")));
    }

    #[test]
    fn no_match_and_malformed_are_none() {
        let d = doc();
        assert_eq!(extract(&d, "$.nope"), None);
        assert_eq!(extract(&d, "$.store.book[9]"), None);
        assert_eq!(extract(&d, "$.store["), None);
        assert_eq!(extract(&d, "$.store.book[abc]"), None);
        assert_eq!(extract(&d, "$."), None);
    }

    #[test]
    fn scalars_only_match_the_root() {
        assert_eq!(extract(&json!("text"), "$"), Some(json!("text")));
        assert_eq!(extract(&json!("text"), "$.a"), None);
    }
}
