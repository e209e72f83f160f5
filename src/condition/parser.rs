//! # Condition grammar
//!
//! ```text
//! chain      := comparison ( logical comparison )*
//! comparison := operand op operand
//! op         := "==" | "!=" | ">=" | "<=" | ">" | "<"
//!             | "contains" | "startsWith" | "endsWith"
//! logical    := "AND" | "OR" | "&&" | "||"
//! operand    := string | number | "true" | "false" | "null" | reference
//! reference  := segment ( "." segment )*
//! ```
//!
//! Keywords are case-insensitive. Strings may be double-quoted (with `\"`
//! and `\\` escapes) or single-quoted. A chain is parsed into the linked
//! [`ConditionExpression`] record; each logical operator links to the rest
//! of the chain.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, none_of},
    combinator::{all_consuming, map, map_res, not, opt, peek, recognize, value},
    error::{context, convert_error, VerboseError},
    multi::separated_list1,
    sequence::{delimited, pair, terminated, tuple},
    IResult,
};
use tracing::debug;

use super::{
    ComparisonOperator, ConditionChain, ConditionError, ConditionExpression, LogicalOperator,
    Operand, Value,
};

type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '*' || c == '-'
}

fn word_boundary(input: &str) -> ParserResult<()> {
    not(peek(take_while1(is_ident_char)))(input)
}

fn parse_double_quoted(input: &str) -> ParserResult<String> {
    context(
        "double quoted string",
        delimited(
            char('"'),
            map(
                opt(escaped_transform(
                    none_of("\\\""),
                    '\\',
                    alt((
                        value("\\", tag("\\")),
                        value("\"", tag("\"")),
                        value("'", tag("'")),
                    )),
                )),
                Option::unwrap_or_default,
            ),
            char('"'),
        ),
    )(input)
}

fn parse_single_quoted(input: &str) -> ParserResult<String> {
    context(
        "single quoted string",
        delimited(
            char('\''),
            map(opt(is_not("'")), |s: Option<&str>| {
                s.unwrap_or_default().to_string()
            }),
            char('\''),
        ),
    )(input)
}

fn parse_number(input: &str) -> ParserResult<Value> {
    context(
        "number",
        terminated(
            map_res(
                recognize(tuple((
                    opt(char('-')),
                    digit1,
                    opt(pair(char('.'), digit1)),
                ))),
                |s: &str| {
                    if s.contains('.') {
                        s.parse::<f64>().map(Value::Float).map_err(|e| e.to_string())
                    } else {
                        s.parse::<i64>().map(Value::Integer).map_err(|e| e.to_string())
                    }
                },
            ),
            word_boundary,
        ),
    )(input)
}

fn parse_keyword_literal(input: &str) -> ParserResult<Value> {
    context(
        "keyword literal",
        terminated(
            alt((
                value(Value::Boolean(true), tag_no_case("true")),
                value(Value::Boolean(false), tag_no_case("false")),
                value(Value::Null, tag_no_case("null")),
            )),
            word_boundary,
        ),
    )(input)
}

fn parse_reference(input: &str) -> ParserResult<String> {
    context(
        "reference",
        map(
            recognize(separated_list1(char('.'), take_while1(is_ident_char))),
            str::to_string,
        ),
    )(input)
}

fn parse_operand(input: &str) -> ParserResult<Operand> {
    context(
        "operand",
        alt((
            map(alt((parse_double_quoted, parse_single_quoted)), |s| {
                Operand::Literal(Value::String(s))
            }),
            map(parse_number, Operand::Literal),
            map(parse_keyword_literal, Operand::Literal),
            map(parse_reference, Operand::Reference),
        )),
    )(input)
}

fn parse_comparison_operator(input: &str) -> ParserResult<ComparisonOperator> {
    context(
        "comparison operator",
        map_res(
            alt((
                tag(">="),
                tag("<="),
                tag("=="),
                tag("!="),
                tag(">"),
                tag("<"),
                terminated(
                    alt((
                        tag_no_case("contains"),
                        tag_no_case("startsWith"),
                        tag_no_case("endsWith"),
                    )),
                    word_boundary,
                ),
            )),
            |s: &str| s.parse::<ComparisonOperator>(),
        ),
    )(input)
}

fn parse_logical_operator(input: &str) -> ParserResult<LogicalOperator> {
    context(
        "logical operator",
        map_res(
            alt((
                tag("&&"),
                tag("||"),
                terminated(alt((tag_no_case("AND"), tag_no_case("OR"))), word_boundary),
            )),
            |s: &str| s.parse::<LogicalOperator>(),
        ),
    )(input)
}

fn parse_comparison(input: &str) -> ParserResult<ConditionExpression> {
    context(
        "comparison",
        map(
            tuple((
                parse_operand,
                delimited(multispace0, parse_comparison_operator, multispace0),
                parse_operand,
            )),
            |(left, operator, right)| ConditionExpression::new(left, operator, right),
        ),
    )(input)
}

fn parse_chain(input: &str) -> ParserResult<ConditionExpression> {
    let (input, mut expression) = parse_comparison(input)?;
    let (input, rest) = opt(pair(
        delimited(multispace0, parse_logical_operator, multispace0),
        parse_chain,
    ))(input)?;
    expression.chain = rest.map(|(operator, next)| ConditionChain {
        operator,
        next: Box::new(next),
    });
    Ok((input, expression))
}

/// Parses a full condition string. The whole input must be consumed.
#[tracing::instrument(level = "debug")]
pub fn parse_condition(input: &str) -> Result<ConditionExpression, ConditionError> {
    if input.trim().is_empty() {
        return Err(ConditionError::Empty);
    }
    match all_consuming(delimited(multispace0, parse_chain, multispace0))(input) {
        Ok((_, expression)) => {
            debug!(comparisons = expression.comparisons().count(), "condition parsed");
            Ok(expression)
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(ConditionError::Syntax {
            input: input.to_string(),
            message: convert_error(input, e),
        }),
        Err(nom::Err::Incomplete(_)) => Err(ConditionError::Syntax {
            input: input.to_string(),
            message: "incomplete input".to_string(),
        }),
    }
}
