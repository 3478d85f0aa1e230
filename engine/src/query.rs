//! Path expressions for interactive queries.
//!
//! Dot-separated components, each of the form
//! `((cast-type(-offset)?))? symbol(<candidate>)? ([index])*`. The optional
//! cast reinterprets the step's result, the candidate index forces (or with
//! `<0>` disables) alternative-type resolution, brackets index arrays.

use crate::error::{InsightError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum CastOffset {
    /// Subtract a literal byte count.
    Bytes(u64),
    /// Subtract the offset of this member within the cast type.
    Member(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryComponent {
    pub cast_type: Option<String>,
    pub cast_offset: Option<CastOffset>,
    pub symbol: String,
    /// `None`: resolve normally. `Some(0)`: ignore alternative types.
    /// `Some(k)`: force the k-th candidate (1-based).
    pub candidate: Option<usize>,
    pub indexes: Vec<i64>,
}

pub fn parse_query(input: &str) -> Result<Vec<QueryComponent>> {
    let mut components = Vec::new();
    for part in input.split('.') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        components.push(parse_component(part)?);
    }
    if components.is_empty() {
        return Err(InsightError::Query("empty query string".into()));
    }
    Ok(components)
}

fn parse_component(text: &str) -> Result<QueryComponent> {
    let mut p = Parser {
        chars: text.char_indices().peekable(),
        text,
    };
    let mut comp = QueryComponent::default();

    p.skip_ws();
    if p.eat('(') {
        p.skip_ws();
        comp.cast_type = Some(p.symbol()?);
        p.skip_ws();
        if p.eat('-') {
            p.skip_ws();
            let word = p.symbol()?;
            comp.cast_offset = Some(match word.parse::<u64>() {
                Ok(n) => CastOffset::Bytes(n),
                Err(_) => CastOffset::Member(word),
            });
            p.skip_ws();
        }
        if !p.eat(')') {
            return p.fail("expected ')' after cast type");
        }
    }

    p.skip_ws();
    comp.symbol = p.symbol()?;

    p.skip_ws();
    if p.eat('<') {
        p.skip_ws();
        let n = p.number()?;
        p.skip_ws();
        if !p.eat('>') {
            return p.fail("expected '>' after candidate index");
        }
        comp.candidate = Some(n as usize);
    }

    p.skip_ws();
    while p.eat('[') {
        p.skip_ws();
        let negative = p.eat('-');
        let n = p.number()? as i64;
        comp.indexes.push(if negative { -n } else { n });
        p.skip_ws();
        if !p.eat(']') {
            return p.fail("expected ']' after array index");
        }
        p.skip_ws();
    }

    p.skip_ws();
    if p.chars.peek().is_some() {
        return p.fail("trailing characters in query component");
    }
    Ok(comp)
}

struct Parser<'s> {
    chars: std::iter::Peekable<std::str::CharIndices<'s>>,
    text: &'s str,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
    }

    fn eat(&mut self, want: char) -> bool {
        self.chars.next_if(|(_, c)| *c == want).is_some()
    }

    fn symbol(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some((_, c)) = self
            .chars
            .next_if(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        {
            out.push(c);
        }
        if out.is_empty() {
            return Err(InsightError::Query(format!(
                "expected a symbol in query component \"{}\"",
                self.text
            )));
        }
        Ok(out)
    }

    fn number(&mut self) -> Result<u64> {
        let mut out = String::new();
        while let Some((_, c)) = self.chars.next_if(|(_, c)| c.is_ascii_digit()) {
            out.push(c);
        }
        out.parse::<u64>()
            .map_err(|_| InsightError::Query(format!("expected a number in \"{}\"", self.text)))
    }

    fn fail<T>(&mut self, msg: &str) -> Result<T> {
        Err(InsightError::Query(format!("{msg}: \"{}\"", self.text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_symbol_chain() {
        let q = parse_query("init_task.tasks.next").unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q[0].symbol, "init_task");
        assert_eq!(q[2].symbol, "next");
        assert!(q[1].cast_type.is_none());
    }

    #[test]
    fn cast_with_member_offset() {
        let q = parse_query("(task_struct-tasks)p").unwrap();
        assert_eq!(q[0].cast_type.as_deref(), Some("task_struct"));
        assert_eq!(q[0].cast_offset, Some(CastOffset::Member("tasks".into())));
        assert_eq!(q[0].symbol, "p");
    }

    #[test]
    fn cast_with_numeric_offset() {
        let q = parse_query("(task_struct-16)p").unwrap();
        assert_eq!(q[0].cast_offset, Some(CastOffset::Bytes(16)));
    }

    #[test]
    fn candidate_and_indexes() {
        let q = parse_query("fp.private_data<2>.sk").unwrap();
        assert_eq!(q[1].symbol, "private_data");
        assert_eq!(q[1].candidate, Some(2));
        let q = parse_query("files[3][4]").unwrap();
        assert_eq!(q[0].indexes, vec![3, 4]);
        let q = parse_query("p<0>").unwrap();
        assert_eq!(q[0].candidate, Some(0));
    }

    #[test]
    fn whitespace_tolerated() {
        let q = parse_query("( file ) fp < 1 > [ 2 ]").unwrap();
        assert_eq!(q[0].cast_type.as_deref(), Some("file"));
        assert_eq!(q[0].candidate, Some(1));
        assert_eq!(q[0].indexes, vec![2]);
    }

    #[test]
    fn malformed_components_rejected() {
        assert!(parse_query("").is_err());
        assert!(parse_query("(unclosed foo").is_err());
        assert!(parse_query("sym<>").is_err());
        assert!(parse_query("sym[1").is_err());
        assert!(parse_query("sym)x").is_err());
    }
}
