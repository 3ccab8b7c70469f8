//! GBNF grammar text → rule AST, using nom.
//!
//! ```text
//! root  ::= item ("," ws item)*
//! item  ::= [a-z]+ | "\"" [^"]* "\""   # comments run to end of line
//! ws    ::= [ \t\n]*
//! ```

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while_m_n, take_while1},
    character::complete::{char, multispace1, none_of, not_line_ending},
    combinator::{map, map_opt, opt, recognize, value},
    multi::{many0, many1, separated_list1},
    sequence::{delimited, pair, preceded},
};

use crate::error::{Error, Result};

/// One named rule: `name ::= alt1 | alt2 | ...`
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDef {
    pub name: String,
    pub alternatives: Vec<Alternative>,
}

/// A sequence of terms; empty means epsilon.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative(pub Vec<Term>);

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// `"text"`
    Literal(String),
    /// `[a-z0-9]` or `[^\n]`, ranges inclusive.
    Class { negated: bool, ranges: Vec<(char, char)> },
    /// `.` matches any single character.
    Any,
    /// Reference to another rule.
    Ref(String),
    /// `( alt1 | alt2 )`
    Group(Vec<Alternative>),
    Repeat(Box<Term>, Repeat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// `*`
    ZeroOrMore,
    /// `+`
    OneOrMore,
    /// `?`
    Optional,
}

/// Parse grammar text into rule definitions, in source order.
pub fn parse(src: &str) -> Result<Vec<RuleDef>> {
    let (rest, rules) = many1(preceded(ws, rule))(src)
        .map_err(|e| Error::GrammarParse(describe(src, e)))?;
    let (rest, _) = ws(rest).map_err(|e| Error::GrammarParse(describe(src, e)))?;
    if !rest.is_empty() {
        let snippet: String = rest.chars().take(24).collect();
        return Err(Error::GrammarParse(format!(
            "unexpected input at byte {}: {snippet:?}",
            src.len() - rest.len()
        )));
    }
    Ok(rules)
}

fn describe(src: &str, e: nom::Err<nom::error::Error<&str>>) -> String {
    match e {
        nom::Err::Error(inner) | nom::Err::Failure(inner) => {
            let snippet: String = inner.input.chars().take(24).collect();
            format!(
                "expected {:?} at byte {}: {snippet:?}",
                inner.code,
                src.len() - inner.input.len()
            )
        }
        nom::Err::Incomplete(_) => "incomplete grammar".to_string(),
    }
}

/// Whitespace, newlines and `#` comments.
fn ws(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((multispace1, recognize(pair(char('#'), not_line_ending))))),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')(input)
}

fn rule(input: &str) -> IResult<&str, RuleDef> {
    let (input, name) = identifier(input)?;
    let (input, _) = ws(input)?;
    let (input, _) = tag("::=")(input)?;
    let (input, alternatives) = alternatives(input)?;
    Ok((
        input,
        RuleDef {
            name: name.to_string(),
            alternatives,
        },
    ))
}

fn alternatives(input: &str) -> IResult<&str, Vec<Alternative>> {
    separated_list1(preceded(ws, char('|')), sequence)(input)
}

fn sequence(input: &str) -> IResult<&str, Alternative> {
    map(many0(preceded(ws, repeated_term)), Alternative)(input)
}

fn repeated_term(input: &str) -> IResult<&str, Term> {
    let (input, base) = term(input)?;
    let (input, rep) = opt(alt((
        value(Repeat::ZeroOrMore, char('*')),
        value(Repeat::OneOrMore, char('+')),
        value(Repeat::Optional, char('?')),
    )))(input)?;
    Ok((
        input,
        match rep {
            Some(r) => Term::Repeat(Box::new(base), r),
            None => base,
        },
    ))
}

fn term(input: &str) -> IResult<&str, Term> {
    alt((
        literal,
        class,
        value(Term::Any, char('.')),
        group,
        rule_ref,
    ))(input)
}

fn hex_char(digits: usize) -> impl Fn(&str) -> IResult<&str, char> {
    move |input: &str| {
        map_opt(
            take_while_m_n(digits, digits, |c: char| c.is_ascii_hexdigit()),
            |h: &str| u32::from_str_radix(h, 16).ok().and_then(char::from_u32),
        )(input)
    }
}

fn escape(input: &str) -> IResult<&str, char> {
    preceded(
        char('\\'),
        alt((
            value('\n', char('n')),
            value('\r', char('r')),
            value('\t', char('t')),
            value('\\', char('\\')),
            value('"', char('"')),
            value('\'', char('\'')),
            value('[', char('[')),
            value(']', char(']')),
            value('-', char('-')),
            value('^', char('^')),
            preceded(char('x'), hex_char(2)),
            preceded(char('u'), hex_char(4)),
            preceded(char('U'), hex_char(8)),
        )),
    )(input)
}

fn literal(input: &str) -> IResult<&str, Term> {
    map(
        delimited(char('"'), many0(alt((escape, none_of("\"\\")))), char('"')),
        |chars| Term::Literal(chars.into_iter().collect()),
    )(input)
}

fn class_char(input: &str) -> IResult<&str, char> {
    alt((escape, none_of("]\\")))(input)
}

fn class(input: &str) -> IResult<&str, Term> {
    let (input, _) = char('[')(input)?;
    let (input, negated) = opt(char('^'))(input)?;
    let (input, ranges) = many1(pair(class_char, opt(preceded(char('-'), class_char))))(input)?;
    let (input, _) = char(']')(input)?;
    Ok((
        input,
        Term::Class {
            negated: negated.is_some(),
            ranges: ranges
                .into_iter()
                .map(|(lo, hi)| (lo, hi.unwrap_or(lo)))
                .collect(),
        },
    ))
}

fn group(input: &str) -> IResult<&str, Term> {
    let (input, _) = char('(')(input)?;
    let (input, alts) = alternatives(input)?;
    let (input, _) = ws(input)?;
    let (input, _) = char(')')(input)?;
    Ok((input, Term::Group(alts)))
}

/// A rule name, unless `::=` follows (that starts the next definition).
fn rule_ref(input: &str) -> IResult<&str, Term> {
    let (rest, name) = identifier(input)?;
    let (after_ws, _) = ws(rest)?;
    if after_ws.starts_with("::=") {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((rest, Term::Ref(name.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rules_and_refs() {
        let rules = parse("root ::= greeting \" world\"\ngreeting ::= \"hello\" | \"hi\"\n").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "root");
        assert_eq!(
            rules[0].alternatives,
            vec![Alternative(vec![
                Term::Ref("greeting".into()),
                Term::Literal(" world".into())
            ])]
        );
        assert_eq!(rules[1].alternatives.len(), 2);
    }

    #[test]
    fn parses_classes_and_repeats() {
        let rules = parse(r#"root ::= [^a-c\n]+ [0-9x]? ."#).unwrap();
        let Alternative(terms) = &rules[0].alternatives[0];
        assert_eq!(
            terms[0],
            Term::Repeat(
                Box::new(Term::Class {
                    negated: true,
                    ranges: vec![('a', 'c'), ('\n', '\n')],
                }),
                Repeat::OneOrMore
            )
        );
        assert_eq!(
            terms[1],
            Term::Repeat(
                Box::new(Term::Class {
                    negated: false,
                    ranges: vec![('0', '9'), ('x', 'x')],
                }),
                Repeat::Optional
            )
        );
        assert_eq!(terms[2], Term::Any);
    }

    #[test]
    fn groups_span_lines_and_comments_are_skipped() {
        let src = "# leading comment\nroot ::= (\n  \"a\" |   # first\n  \"b\"\n)*\n";
        let rules = parse(src).unwrap();
        assert_eq!(rules.len(), 1);
        match &rules[0].alternatives[0].0[0] {
            Term::Repeat(inner, Repeat::ZeroOrMore) => match inner.as_ref() {
                Term::Group(alts) => assert_eq!(alts.len(), 2),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn escapes_in_literals() {
        let rules = parse(r#"root ::= "a\n\x41\"""#).unwrap();
        assert_eq!(
            rules[0].alternatives[0].0[0],
            Term::Literal("a\nA\"".into())
        );
    }

    #[test]
    fn malformed_input_is_a_parse_error() {
        assert!(matches!(parse("root ::= \"open"), Err(Error::GrammarParse(_))));
        assert!(matches!(parse("::= \"x\""), Err(Error::GrammarParse(_))));
        assert!(matches!(parse("root ::= [a-z"), Err(Error::GrammarParse(_))));
    }
}
