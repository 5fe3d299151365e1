//! A small, deterministic template language.
//!
//! Actions are delimited by `{{ }}` and hold one pipeline:
//!
//! ```text
//! {{ .Values.image.tag | default "latest" | quote }}
//! {{ required "image.repository is required" .Values.image.repository }}
//! {{ secretRef "db-credentials" "password" }}
//! {{- .Release.Name -}}        trims surrounding whitespace
//! {{/* comment */}}
//! ```
//!
//! A piped value becomes the last argument of the next function. Maps and
//! lists render as JSON, which is valid YAML flow syntax. Referencing a
//! value that does not exist is an error unless a `default` or `required`
//! handles it.

use serde_json::Value;

use super::values::lookup;
use super::RenderError;

/// Prefix of rendered secret handles.
pub const SECRET_REF_PREFIX: &str = "secretref:";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Int(i64),
    Bool(bool),
    Ident(String),
    Pipe,
}

/// An evaluated argument; `None` when a path resolved to nothing.
#[derive(Debug, Clone)]
struct Arg {
    value: Option<Value>,
    source: String,
}

enum Fault {
    Syntax(String),
    Missing(String),
}

/// Renders `source` against `context`. `name` is used in error messages.
pub fn render_template(name: &str, source: &str, context: &Value) -> Result<String, RenderError> {
    let mut out = String::with_capacity(source.len());
    let mut pos = 0;
    let mut trim_next = false;

    while let Some(found) = source[pos..].find("{{") {
        let start = pos + found;
        let mut text = &source[pos..start];
        if trim_next {
            text = text.trim_start();
        }

        let body_start = start + 2;
        let body_len = source[body_start..].find("}}").ok_or_else(|| RenderError::TemplateSyntax {
            template: name.to_string(),
            line: line_of(source, start),
            message: "unclosed action".to_string(),
        })?;
        let raw = &source[body_start..body_start + body_len];

        let trim_left = raw.starts_with("- ") || raw.starts_with("-\t") || raw.starts_with("-\n");
        let trim_right = raw.ends_with(" -") || raw.ends_with("\t-") || raw.ends_with("\n-");
        let mut action = raw;
        if trim_left {
            action = &action[1..];
        }
        if trim_right {
            action = &action[..action.len() - 1];
        }

        out.push_str(if trim_left { text.trim_end() } else { text });

        let action = action.trim();
        if !(action.starts_with("/*") && action.ends_with("*/")) {
            let rendered = evaluate(action, context).map_err(|fault| {
                let line = line_of(source, start);
                match fault {
                    Fault::Syntax(message) => RenderError::TemplateSyntax {
                        template: name.to_string(),
                        line,
                        message,
                    },
                    Fault::Missing(message) => RenderError::MissingValue {
                        template: name.to_string(),
                        line,
                        message,
                    },
                }
            })?;
            out.push_str(&rendered);
        }

        pos = body_start + body_len + 2;
        trim_next = trim_right;
    }

    let tail = &source[pos..];
    out.push_str(if trim_next { tail.trim_start() } else { tail });
    Ok(out)
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn evaluate(action: &str, context: &Value) -> Result<String, Fault> {
    if action.is_empty() {
        return Err(Fault::Syntax("empty action".to_string()));
    }
    let tokens = tokenize(action)?;
    let mut stages = tokens.split(|t| *t == Token::Pipe);

    let first = stages
        .next()
        .ok_or_else(|| Fault::Syntax("empty pipeline".to_string()))?;
    let mut current = match first {
        [Token::Ident(func), args @ ..] => call(func, terms(args, context)?)?,
        [term] => term_value(term, context)?,
        [] => return Err(Fault::Syntax("empty pipeline stage".to_string())),
        _ => return Err(Fault::Syntax(format!("unexpected arguments in '{}'", action))),
    };

    for stage in stages {
        match stage {
            [Token::Ident(func), args @ ..] => {
                let mut args = terms(args, context)?;
                args.push(current);
                current = call(func, args)?;
            }
            _ => return Err(Fault::Syntax(format!("expected a function after '|' in '{}'", action))),
        }
    }

    match current.value {
        Some(value) => Ok(to_text(&value)),
        None => Err(Fault::Missing(format!("no value for {}", current.source))),
    }
}

fn terms(tokens: &[Token], context: &Value) -> Result<Vec<Arg>, Fault> {
    tokens.iter().map(|t| term_value(t, context)).collect()
}

fn term_value(token: &Token, context: &Value) -> Result<Arg, Fault> {
    let (value, source) = match token {
        Token::Path(path) => (lookup(context, path).cloned(), format!(".{}", path)),
        Token::Str(s) => (Some(Value::String(s.clone())), format!("{:?}", s)),
        Token::Int(n) => (Some(Value::from(*n)), n.to_string()),
        Token::Bool(b) => (Some(Value::Bool(*b)), b.to_string()),
        Token::Ident(name) => {
            return Err(Fault::Syntax(format!(
                "function '{}' must start a pipeline stage",
                name
            )))
        }
        Token::Pipe => return Err(Fault::Syntax("unexpected '|'".to_string())),
    };
    Ok(Arg { value, source })
}

/// Destructures exactly `N` arguments.
fn take<const N: usize>(func: &str, args: Vec<Arg>) -> Result<[Arg; N], Fault> {
    let got = args.len();
    args.try_into().map_err(|_| {
        Fault::Syntax(format!("{} expects {} argument(s), got {}", func, N, got))
    })
}

/// Takes the single argument's value or reports it missing.
fn present(arg: Arg) -> Result<(Value, String), Fault> {
    match arg.value {
        Some(value) => Ok((value, arg.source)),
        None => Err(Fault::Missing(format!("no value for {}", arg.source))),
    }
}

/// Null, empty strings and empty collections count as unset.
fn is_empty(value: &Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        Some(_) => false,
    }
}

fn call(func: &str, args: Vec<Arg>) -> Result<Arg, Fault> {
    let text = |value: Value, source: String| Arg {
        value: Some(value),
        source,
    };

    match func {
        "default" => {
            let [fallback, value] = take(func, args)?;
            Ok(if is_empty(&value.value) { fallback } else { value })
        }
        "required" => {
            let [message, value] = take(func, args)?;
            if is_empty(&value.value) {
                let message = message
                    .value
                    .as_ref()
                    .map(to_text)
                    .unwrap_or_else(|| format!("{} is required", value.source));
                return Err(Fault::Missing(message));
            }
            Ok(value)
        }
        "quote" => {
            let [arg] = take(func, args)?;
            let (value, source) = present(arg)?;
            let quoted = Value::String(to_text(&value)).to_string();
            Ok(text(Value::String(quoted), source))
        }
        "toJson" => {
            let [arg] = take(func, args)?;
            let (value, source) = present(arg)?;
            Ok(text(Value::String(value.to_string()), source))
        }
        "upper" | "lower" | "trim" => {
            let [arg] = take(func, args)?;
            let (value, source) = present(arg)?;
            let s = to_text(&value);
            let transformed = match func {
                "upper" => s.to_uppercase(),
                "lower" => s.to_lowercase(),
                _ => s.trim().to_string(),
            };
            Ok(text(Value::String(transformed), source))
        }
        "secretRef" => {
            let [name, key] = take(func, args)?;
            match (&name.value, &key.value) {
                (Some(Value::String(n)), Some(Value::String(k))) if !n.is_empty() && !k.is_empty() => {
                    let handle = format!("{}{}/{}", SECRET_REF_PREFIX, n, k);
                    Ok(text(Value::String(handle), format!("secretRef {}", n)))
                }
                _ => Err(Fault::Syntax(
                    "secretRef expects a secret name and key as non-empty strings".to_string(),
                )),
            }
        }
        other => Err(Fault::Syntax(format!("unknown function '{}'", other))),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, Fault> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '|' {
            tokens.push(Token::Pipe);
            i += 1;
        } else if c == '"' {
            let mut s = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(Fault::Syntax("unterminated string literal".to_string())),
                    Some('"') => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| Fault::Syntax("dangling escape".to_string()))?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(ch) => {
                        s.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(s));
        } else if c == '.' {
            let start = i + 1;
            i = start;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Path(chars[start..i].iter().collect()));
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let start = i;
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let n = literal
                .parse()
                .map_err(|_| Fault::Syntax(format!("invalid number '{}'", literal)))?;
            tokens.push(Token::Int(n));
        } else if c.is_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "true" => Token::Bool(true),
                "false" => Token::Bool(false),
                _ => Token::Ident(word),
            });
        } else {
            return Err(Fault::Syntax(format!("unexpected character '{}'", c)));
        }
    }
    Ok(tokens)
}
