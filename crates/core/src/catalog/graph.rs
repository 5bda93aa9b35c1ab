//! Structured filter-graph description rendered to ffmpeg's expression syntax.
//!
//! Every value passes through [`render_value`] on the way out, so user text can
//! never terminate an option, a filter, or a chain. ffmpeg unescapes a graph in
//! two passes: the graph parser splits on `[ ] , ;` and the option parser
//! splits on `: =`. Values are escaped for both, inner level first.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
enum FilterArg {
    Positional(String),
    Named(&'static str, String),
}

/// One filter stage: a name plus ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    name: &'static str,
    args: Vec<FilterArg>,
}

impl Filter {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(FilterArg::Positional(value.to_string()));
        self
    }

    pub fn opt(mut self, key: &'static str, value: impl ToString) -> Self {
        self.args.push(FilterArg::Named(key, value.to_string()));
        self
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Raw (unescaped) value of a named option.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|arg| match arg {
            FilterArg::Named(k, v) if *k == key => Some(v.as_str()),
            _ => None,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for (index, arg) in self.args.iter().enumerate() {
            f.write_str(if index == 0 { "=" } else { ":" })?;
            match arg {
                FilterArg::Positional(value) => f.write_str(&render_value(value))?,
                FilterArg::Named(key, value) => write!(f, "{key}={}", render_value(value))?,
            }
        }
        Ok(())
    }
}

/// Filters applied in sequence to a single stream (`-vf` / `-af`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn extend(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, filter) in self.filters.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{filter}")?;
        }
        Ok(())
    }
}

impl FromIterator<Filter> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Filter>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

/// A chain with explicit input and output pad labels, used in `-filter_complex`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledChain {
    pub inputs: Vec<String>,
    pub chain: FilterChain,
    pub outputs: Vec<String>,
}

impl fmt::Display for LabeledChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in &self.inputs {
            write!(f, "[{label}]")?;
        }
        write!(f, "{}", self.chain)?;
        for label in &self.outputs {
            write!(f, "[{label}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterGraph {
    chains: Vec<LabeledChain>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain<I, O>(mut self, inputs: I, chain: FilterChain, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        self.chains.push(LabeledChain {
            inputs: inputs.into_iter().map(Into::into).collect(),
            chain,
            outputs: outputs.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn chains(&self) -> &[LabeledChain] {
        &self.chains
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, chain) in self.chains.iter().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }
            write!(f, "{chain}")?;
        }
        Ok(())
    }
}

/// Escape a value for both unescaping passes ffmpeg applies.
pub fn render_value(raw: &str) -> String {
    escape_graph_level(&escape_option_level(raw))
}

fn escape_option_level(raw: &str) -> String {
    escape_chars(raw, &['\\', '\'', ':', '='])
}

fn escape_graph_level(raw: &str) -> String {
    escape_chars(raw, &['\\', '\'', '[', ']', ',', ';'])
}

fn escape_chars(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        if special.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Neutralise drawtext's own expansion syntax (`%{...}` and backslash
/// sequences) and flatten control characters.
pub fn escape_drawtext_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '\\' | '%' => {
                out.push('\\');
                out.push(ch);
            }
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

/// Format a number without a trailing `.0` so rendered graphs stay stable.
pub fn num(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == rounded.trunc() {
        format!("{}", rounded as i64)
    } else {
        format!("{rounded}")
    }
}
