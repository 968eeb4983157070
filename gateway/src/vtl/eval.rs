use std::{cmp::Ordering, collections::HashMap, rc::Rc};

use regex::Regex;
use serde_json::{json, Map, Number, Value};

use super::{
    parser::{Accessor, BinOp, Expr, Node, Reference},
    RenderError,
};
use crate::context::{Context, InputAccessor};

const MAX_DEPTH: usize = 64;
const MAX_RANGE: u64 = 10_000;

type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Clone)]
enum Val {
    Data(Value),
    Input,
    Util,
    Block(Rc<Vec<Node>>),
    Undefined,
}

enum Flow {
    Normal,
    Break,
}

pub(crate) struct Renderer<'c> {
    ctx: &'c Context,
    locals: HashMap<String, Val>,
    depth: usize,
    /// Set by `#stop`; every enclosing loop and block unwinds.
    stopped: bool,
}

impl<'c> Renderer<'c> {
    pub(crate) fn new(ctx: &'c Context) -> Self {
        Self {
            ctx,
            locals: HashMap::new(),
            depth: 0,
            stopped: false,
        }
    }

    pub(crate) fn render(&mut self, nodes: &[Node]) -> Result<String> {
        let mut out = String::new();
        self.render_nodes(nodes, &mut out)?;
        Ok(out)
    }

    fn render_nodes(&mut self, nodes: &[Node], out: &mut String) -> Result<Flow> {
        for node in nodes {
            if self.stopped {
                return Ok(Flow::Break);
            }
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Reference(r) => self.write_reference(r, out)?,
                Node::Set { target, value } => {
                    let value = self.eval(value)?;
                    self.assign(target, value)?;
                }
                Node::If {
                    branches,
                    otherwise,
                } => {
                    let mut body = otherwise;
                    for (cond, branch) in branches {
                        if truthy(&self.eval(cond)?) {
                            body = branch;
                            break;
                        }
                    }
                    if let Flow::Break = self.render_nodes(body, out)? {
                        return Ok(Flow::Break);
                    }
                }
                Node::Foreach {
                    var,
                    iterable,
                    body,
                } => {
                    let items = match self.eval(iterable)? {
                        Val::Data(Value::Array(items)) => items,
                        Val::Data(Value::Object(map)) => map.into_iter().map(|(_, v)| v).collect(),
                        _ => Vec::new(),
                    };
                    self.foreach(var, items, body, out)?;
                }
                Node::Define { name, body } => {
                    self.locals
                        .insert(name.clone(), Val::Block(Rc::clone(body)));
                }
                Node::Break => return Ok(Flow::Break),
                Node::Stop => {
                    self.stopped = true;
                    return Ok(Flow::Break);
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn foreach(&mut self, var: &str, items: Vec<Value>, body: &[Node], out: &mut String) -> Result<()> {
        let saved = ["foreach", "velocityCount", var].map(|k| (k, self.locals.remove(k)));
        let len = items.len();
        let mut result = Ok(());
        for (i, item) in items.into_iter().enumerate() {
            self.locals.insert(var.to_string(), Val::Data(item));
            self.locals.insert(
                "foreach".to_string(),
                Val::Data(json!({
                    "index": i,
                    "count": i + 1,
                    "hasNext": i + 1 < len,
                    "first": i == 0,
                    "last": i + 1 == len,
                })),
            );
            self.locals
                .insert("velocityCount".to_string(), Val::Data(json!(i + 1)));
            match self.render_nodes(body, out) {
                Ok(Flow::Normal) => {}
                Ok(Flow::Break) => break,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        for (k, v) in saved {
            match v {
                Some(v) => self.locals.insert(k.to_string(), v),
                None => self.locals.remove(k),
            };
        }
        result
    }

    fn write_reference(&mut self, r: &Reference, out: &mut String) -> Result<()> {
        let Some(value) = self.eval_reference(r)? else {
            if !r.quiet {
                out.push_str(&r.source);
            }
            return Ok(());
        };
        match value {
            Val::Data(Value::Null) | Val::Undefined | Val::Input | Val::Util => {}
            Val::Data(v) => display(&v, out),
            Val::Block(body) => {
                self.render_block(&body, out)?;
            }
        }
        Ok(())
    }

    fn render_block(&mut self, body: &[Node], out: &mut String) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(RenderError::Eval(
                "#define blocks nested too deeply (recursive reference?)".to_string(),
            ));
        }
        self.depth += 1;
        let result = self.render_nodes(body, out);
        self.depth -= 1;
        result.map(|_| ())
    }

    /// `None` when the reference's root is unknown.
    fn eval_reference(&mut self, r: &Reference) -> Result<Option<Val>> {
        let Some(mut current) = self.root(&r.root) else {
            return Ok(None);
        };
        for accessor in &r.chain {
            current = self.access(current, accessor)?;
        }
        Ok(Some(current))
    }

    fn root(&self, name: &str) -> Option<Val> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        match name {
            "context" => Some(Val::Data(self.ctx.context.clone())),
            "input" => Some(Val::Input),
            "util" => Some(Val::Util),
            "stageVariables" => Some(Val::Data(self.ctx.stage_variables.clone())),
            _ => None,
        }
    }

    fn access(&mut self, current: Val, accessor: &Accessor) -> Result<Val> {
        let current = match current {
            Val::Block(body) => {
                let mut text = String::new();
                self.render_block(&body, &mut text)?;
                Val::Data(Value::String(text))
            }
            other => other,
        };

        Ok(match (current, accessor) {
            (Val::Undefined, _) => Val::Undefined,
            (Val::Input, Accessor::Property(name)) if name == "body" => {
                Val::Data(Value::String(self.ctx.input.body().to_string()))
            }
            (Val::Input, Accessor::Method(name, args)) => {
                let args = self.eval_args(args)?;
                self.call_input(name, &args)
            }
            (Val::Util, Accessor::Method(name, args)) => {
                let args = self.eval_args(args)?;
                match self.ctx.util.call(name, &args) {
                    Some(result) => Val::Data(result?),
                    None => Val::Undefined,
                }
            }
            (Val::Data(v), Accessor::Property(name)) => match v {
                Value::Object(mut map) => map.remove(name).map(Val::Data).unwrap_or(Val::Undefined),
                _ => Val::Undefined,
            },
            (Val::Data(v), Accessor::Method(name, args)) => {
                let args = self.eval_args(args)?;
                call_method(v, name, &args)?
            }
            (Val::Data(v), Accessor::Index(index)) => {
                let index = self.eval_data(index)?;
                index_value(v, &index)
            }
            _ => Val::Undefined,
        })
    }

    fn call_input(&self, name: &str, args: &[Value]) -> Val {
        let input = &self.ctx.input;
        match name {
            "path" => input
                .path(&text_of(args.first()))
                .map(Val::Data)
                .unwrap_or(Val::Undefined),
            "json" => Val::Data(Value::String(input.json(&text_of(args.first())))),
            "params" => match args.first() {
                Some(key) => input
                    .param(&text_of(Some(key)))
                    .map(|v| Val::Data(Value::String(v)))
                    .unwrap_or(Val::Undefined),
                None => Val::Data(input.params()),
            },
            "body" => Val::Data(Value::String(input.body().to_string())),
            _ => Val::Undefined,
        }
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>> {
        args.iter().map(|a| self.eval_data(a)).collect()
    }

    fn eval_data(&mut self, expr: &Expr) -> Result<Value> {
        let v = self.eval(expr)?;
        self.to_data(v)
    }

    fn to_data(&mut self, v: Val) -> Result<Value> {
        Ok(match v {
            Val::Data(v) => v,
            Val::Block(body) => {
                let mut text = String::new();
                self.render_block(&body, &mut text)?;
                Value::String(text)
            }
            Val::Input | Val::Util | Val::Undefined => Value::Null,
        })
    }

    fn eval(&mut self, expr: &Expr) -> Result<Val> {
        Ok(match expr {
            Expr::Literal(v) => Val::Data(v.clone()),
            Expr::Interpolated(nodes) => {
                let mut text = String::new();
                self.render_nodes(nodes, &mut text)?;
                Val::Data(Value::String(text))
            }
            Expr::Ref(r) => self.eval_reference(r)?.unwrap_or(Val::Undefined),
            Expr::List(items) => Val::Data(Value::Array(self.eval_args(items)?)),
            Expr::Range(from, to) => {
                let from = self.eval_data(from)?;
                let to = self.eval_data(to)?;
                Val::Data(range(&from, &to)?)
            }
            Expr::Map(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    let key = self.eval_data(k)?;
                    let value = self.eval_data(v)?;
                    map.insert(to_text(&key), value);
                }
                Val::Data(Value::Object(map))
            }
            Expr::Not(inner) => Val::Data(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Binary(BinOp::And, lhs, rhs) => {
                let result = truthy(&self.eval(lhs)?) && truthy(&self.eval(rhs)?);
                Val::Data(Value::Bool(result))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                let result = truthy(&self.eval(lhs)?) || truthy(&self.eval(rhs)?);
                Val::Data(Value::Bool(result))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_data(lhs)?;
                let rhs = self.eval_data(rhs)?;
                binary(*op, &lhs, &rhs)?
            }
        })
    }

    fn assign(&mut self, target: &Reference, value: Val) -> Result<()> {
        // Assigning null leaves the target untouched.
        if matches!(value, Val::Undefined | Val::Data(Value::Null)) {
            return Ok(());
        }
        let Some((last, path)) = target.chain.split_last() else {
            self.locals.insert(target.root.clone(), value);
            return Ok(());
        };

        let value = self.to_data(value)?;
        let Some(Val::Data(root)) = self.locals.get_mut(&target.root) else {
            return Ok(());
        };
        let mut slot = root;
        for accessor in path {
            let Accessor::Property(name) = accessor else {
                return Err(unsupported_target(target));
            };
            let Some(next) = slot.as_object_mut().and_then(|m| m.get_mut(name)) else {
                return Ok(());
            };
            slot = next;
        }
        match (last, slot) {
            (Accessor::Property(name), Value::Object(map)) => {
                map.insert(name.clone(), value);
                Ok(())
            }
            (Accessor::Property(_), _) => Ok(()),
            _ => Err(unsupported_target(target)),
        }
    }
}

fn unsupported_target(target: &Reference) -> RenderError {
    RenderError::Eval(format!("unsupported #set target {}", target.source))
}

fn truthy(v: &Val) -> bool {
    match v {
        Val::Undefined | Val::Data(Value::Null) => false,
        Val::Data(Value::Bool(b)) => *b,
        _ => true,
    }
}

/// Text of a value the way Java's `toString` would print it.
fn display(v: &Value, out: &mut String) {
    match v {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                display(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (k, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(k);
                out.push('=');
                display(item, out);
            }
            out.push('}');
        }
    }
}

fn to_text(v: &Value) -> String {
    let mut out = String::new();
    display(v, &mut out);
    out
}

fn text_of(v: Option<&Value>) -> String {
    v.map(to_text).unwrap_or_default()
}

fn index_value(v: Value, index: &Value) -> Val {
    let found = match (v, index) {
        (Value::Array(mut items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .filter(|i| *i < items.len())
            .map(|i| items.swap_remove(i)),
        (Value::Object(mut map), key) => map.remove(&to_text(key)),
        _ => None,
    };
    found.map(Val::Data).unwrap_or(Val::Undefined)
}

fn as_index(v: Option<&Value>) -> Option<i64> {
    match v? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn call_method(v: Value, name: &str, args: &[Value]) -> Result<Val> {
    let arg = |i: usize| text_of(args.get(i));
    let data = |v: Value| Ok(Val::Data(v));

    if name == "toString" {
        return data(Value::String(to_text(&v)));
    }

    match v {
        Value::Object(map) => match name {
            "keySet" => data(Value::Array(map.keys().cloned().map(Value::String).collect())),
            "get" => Ok(map.get(&arg(0)).cloned().map(Val::Data).unwrap_or(Val::Undefined)),
            "containsKey" => data(Value::Bool(map.contains_key(&arg(0)))),
            "size" => data(json!(map.len())),
            "isEmpty" => data(Value::Bool(map.is_empty())),
            "values" => data(Value::Array(map.values().cloned().collect())),
            "entrySet" => data(Value::Array(
                map.into_iter()
                    .map(|(k, v)| json!({ "key": k, "value": v }))
                    .collect(),
            )),
            _ => Ok(Val::Undefined),
        },
        Value::Array(items) => match name {
            "size" => data(json!(items.len())),
            "isEmpty" => data(Value::Bool(items.is_empty())),
            "get" => Ok(as_index(args.first())
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i).cloned())
                .map(Val::Data)
                .unwrap_or(Val::Undefined)),
            "contains" => {
                let needle = args.first().unwrap_or(&Value::Null);
                data(Value::Bool(items.iter().any(|i| values_equal(i, needle))))
            }
            _ => Ok(Val::Undefined),
        },
        Value::String(s) => string_method(&s, name, args),
        _ => Ok(Val::Undefined),
    }
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Val> {
    let arg = |i: usize| text_of(args.get(i));
    let data = |v: Value| Ok(Val::Data(v));
    let string = |v: String| Ok(Val::Data(Value::String(v)));
    let char_index = |byte: Option<usize>| match byte {
        Some(b) => json!(s[..b].chars().count()),
        None => json!(-1),
    };

    match name {
        "length" | "size" => data(json!(s.chars().count())),
        "isEmpty" => data(Value::Bool(s.is_empty())),
        "toUpperCase" => string(s.to_uppercase()),
        "toLowerCase" => string(s.to_lowercase()),
        "trim" => string(s.trim().to_string()),
        "contains" => data(Value::Bool(s.contains(arg(0).as_str()))),
        "startsWith" => data(Value::Bool(s.starts_with(arg(0).as_str()))),
        "endsWith" => data(Value::Bool(s.ends_with(arg(0).as_str()))),
        "equals" => data(Value::Bool(s == arg(0))),
        "equalsIgnoreCase" => data(Value::Bool(s.to_lowercase() == arg(0).to_lowercase())),
        "indexOf" => data(char_index(s.find(arg(0).as_str()))),
        "lastIndexOf" => data(char_index(s.rfind(arg(0).as_str()))),
        "charAt" => {
            let c = as_index(args.first())
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| s.chars().nth(i))
                .ok_or_else(|| RenderError::Eval(format!("charAt index out of range for {s:?}")))?;
            string(c.to_string())
        }
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let begin = as_index(args.first()).unwrap_or(0);
            let end = match args.get(1) {
                Some(_) => as_index(args.get(1)).unwrap_or(-1),
                None => chars.len() as i64,
            };
            if begin < 0 || end < begin || end > chars.len() as i64 {
                return Err(RenderError::Eval(format!(
                    "substring({begin}, {end}) out of range for {s:?}"
                )));
            }
            string(chars[begin as usize..end as usize].iter().collect())
        }
        "replace" => string(s.replace(arg(0).as_str(), arg(1).as_str())),
        "replaceAll" => {
            let re = regex(&arg(0))?;
            string(re.replace_all(s, arg(1).as_str()).into_owned())
        }
        "split" => {
            let re = regex(&arg(0))?;
            let mut parts: Vec<&str> = re.split(s).collect();
            // Java drops trailing empty strings.
            while parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
                parts.pop();
            }
            data(Value::Array(
                parts.into_iter().map(|p| Value::String(p.to_string())).collect(),
            ))
        }
        _ => Ok(Val::Undefined),
    }
}

fn regex(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|err| RenderError::Eval(format!("invalid regex {pattern:?}: {err}")))
}

fn range(from: &Value, to: &Value) -> Result<Value> {
    let (Some(from), Some(to)) = (as_index(Some(from)), as_index(Some(to))) else {
        return Err(RenderError::Eval("range bounds must be integers".to_string()));
    };
    if from.abs_diff(to) >= MAX_RANGE {
        return Err(RenderError::Eval(format!("range [{from}..{to}] is too large")));
    }
    let items: Vec<Value> = if from <= to {
        (from..=to).map(Value::from).collect()
    } else {
        (to..=from).rev().map(Value::from).collect()
    };
    Ok(Value::Array(items))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => a == b,
        (a, b) => to_text(a) == to_text(b),
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering> {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    };
    ordering.ok_or_else(|| {
        RenderError::Eval(format!("cannot compare {} with {}", a, b))
    })
}

enum Num {
    Int(i64),
    Float(f64),
}

fn num(v: &Value) -> Option<Num> {
    let Value::Number(n) = v else {
        return None;
    };
    match n.as_i64() {
        Some(i) => Some(Num::Int(i)),
        None => n.as_f64().map(Num::Float),
    }
}

fn float(n: &Num) -> f64 {
    match n {
        Num::Int(i) => *i as f64,
        Num::Float(f) => *f,
    }
}

fn from_float(f: f64) -> Val {
    Number::from_f64(f)
        .map(|n| Val::Data(Value::Number(n)))
        .unwrap_or(Val::Undefined)
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Val> {
    let bool_val = |b: bool| Ok(Val::Data(Value::Bool(b)));
    match op {
        BinOp::Eq => return bool_val(values_equal(lhs, rhs)),
        BinOp::Ne => return bool_val(!values_equal(lhs, rhs)),
        BinOp::Lt => return bool_val(compare(lhs, rhs)? == Ordering::Less),
        BinOp::Le => return bool_val(compare(lhs, rhs)? != Ordering::Greater),
        BinOp::Gt => return bool_val(compare(lhs, rhs)? == Ordering::Greater),
        BinOp::Ge => return bool_val(compare(lhs, rhs)? != Ordering::Less),
        _ => {}
    }

    if op == BinOp::Add && (lhs.is_string() || rhs.is_string()) {
        return Ok(Val::Data(Value::String(to_text(lhs) + &to_text(rhs))));
    }

    let (Some(a), Some(b)) = (num(lhs), num(rhs)) else {
        // Arithmetic on non-numbers yields null.
        return Ok(Val::Undefined);
    };

    if let (Num::Int(x), Num::Int(y)) = (&a, &b) {
        let (x, y) = (*x, *y);
        let result = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            BinOp::Div => x.checked_div(y),
            BinOp::Rem => x.checked_rem(y),
            _ => None,
        };
        if let Some(r) = result {
            return Ok(Val::Data(json!(r)));
        }
        if y == 0 && matches!(op, BinOp::Div | BinOp::Rem) {
            return Ok(Val::Undefined);
        }
    }

    let (x, y) = (float(&a), float(&b));
    Ok(match op {
        BinOp::Add => from_float(x + y),
        BinOp::Sub => from_float(x - y),
        BinOp::Mul => from_float(x * y),
        BinOp::Div if y == 0.0 => Val::Undefined,
        BinOp::Div => from_float(x / y),
        BinOp::Rem if y == 0.0 => Val::Undefined,
        BinOp::Rem => from_float(x % y),
        _ => Val::Undefined,
    })
}
