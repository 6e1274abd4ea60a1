use colored::Colorize;
use rust_decimal::Decimal;

use crate::models::BatchStatus;

/// Format a fixed-point amount as a dollar string with thousands
/// separators: $1,234.56
pub fn money(val: Decimal) -> String {
    let negative = val.is_sign_negative() && !val.is_zero();
    let cents = format!("{:.2}", val.abs());
    let parts: Vec<&str> = cents.split('.').collect();
    let int_part = parts[0];
    let dec_part = parts[1];

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative {
        format!("-${with_commas}.{dec_part}")
    } else {
        format!("${with_commas}.{dec_part}")
    }
}

pub fn status_colored(status: BatchStatus) -> String {
    let text = status.as_str();
    match status {
        BatchStatus::Completed => text.green().to_string(),
        BatchStatus::CompletedWithErrors | BatchStatus::AlreadyImported => {
            text.yellow().to_string()
        }
        BatchStatus::Failed => text.red().to_string(),
        BatchStatus::Running => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(d("1234.56")), "$1,234.56");
        assert_eq!(money(d("-500.00")), "-$500.00");
        assert_eq!(money(d("0")), "$0.00");
        assert_eq!(money(d("1000000.99")), "$1,000,000.99");
        assert_eq!(money(d("42.1")), "$42.10");
    }
}
