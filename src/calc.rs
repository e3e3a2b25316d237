// 计算器工具的算术求值：手写递归下降解析，不依赖任何通用求值器。
// 文法：expr := term (('+'|'-') term)* ; term := unary (('*'|'/') unary)* ;
//       unary := '-' unary | primary ; primary := number | '(' expr ')'

/// 先剔除白名单以外的字符，再解析求值。输入完全非法时返回 Err，不会 panic。
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let cleaned: String = expression
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '-' | '*' | '/' | '(' | ')' | '.'))
        .collect();
    if cleaned.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser {
        input: cleaned.as_bytes(),
        pos: 0,
    };
    let value = parser.parse_expr()?;
    if parser.pos != parser.input.len() {
        return Err(format!(
            "unexpected character at position {}",
            parser.pos + 1
        ));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    Ok(value)
}

/// 工具输出格式：整数结果不带小数部分。
pub fn format_result(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("Result: {}", value as i64)
    } else {
        format!("Result: {value}")
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut value = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                b'+' => {
                    self.pos += 1;
                    value += self.parse_term()?;
                }
                b'-' => {
                    self.pos += 1;
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, String> {
        let mut value = self.parse_unary()?;
        while let Some(op) = self.peek() {
            match op {
                b'*' => {
                    self.pos += 1;
                    value *= self.parse_unary()?;
                }
                b'/' => {
                    self.pos += 1;
                    let divisor = self.parse_unary()?;
                    if divisor == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<f64, String> {
        if self.peek() == Some(b'-') {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.parse_expr()?;
                if self.peek() != Some(b')') {
                    return Err("missing closing parenthesis".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(ch) if ch.is_ascii_digit() || ch == b'.' => self.parse_number(),
            Some(ch) => Err(format!("unexpected character '{}'", ch as char)),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    fn parse_number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.pos += 1;
            } else if ch == b'.' && !seen_dot {
                seen_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "invalid number".to_string())?;
        text.parse::<f64>()
            .map_err(|_| format!("invalid number '{text}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_formatting() {
        assert_eq!(format_result(evaluate("2 + 2 * 3").expect("evaluate")), "Result: 8");
        assert_eq!(evaluate("(2 + 2) * 3").expect("evaluate"), 12.0);
        assert_eq!(evaluate("10 / 4").expect("evaluate"), 2.5);
        assert_eq!(evaluate("-3 + 5").expect("evaluate"), 2.0);
        assert_eq!(evaluate("2*-3").expect("evaluate"), -6.0);
    }

    #[test]
    fn strips_disallowed_characters_before_parsing() {
        // 字母会被剔除，剩下的表达式照常求值。
        assert_eq!(evaluate("2 apples + 2 pears").expect("evaluate"), 4.0);
    }

    #[test]
    fn invalid_input_is_an_error_not_a_panic() {
        assert!(evaluate("hello world").is_err());
        assert!(evaluate("").is_err());
        assert!(evaluate("1 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("1 / 0").is_err());
        assert!(evaluate("1..2").is_err());
    }

    #[test]
    fn decimal_results_keep_fraction() {
        assert_eq!(format_result(2.5), "Result: 2.5");
        assert_eq!(format_result(8.0), "Result: 8");
    }
}
