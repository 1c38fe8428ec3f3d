//! Ecuadorian cédula (national identity number) validation.
//!
//! Ten digits: two-digit province code (01-24), a third digit below 6
//! for natural persons, six sequence digits and a module-10 check digit
//! computed with alternating coefficients 2,1,2,1... where any product
//! above 9 has 9 subtracted.

pub fn is_valid(cedula: &str) -> bool {
    let digits: Vec<u32> = cedula.chars().filter_map(|c| c.to_digit(10)).collect();
    if cedula.len() != 10 || digits.len() != 10 {
        return false;
    }

    let province = digits[0] * 10 + digits[1];
    if !(1..=24).contains(&province) {
        return false;
    }
    if digits[2] > 5 {
        return false;
    }

    let mut sum = 0u32;
    for (i, d) in digits.iter().take(9).enumerate() {
        let mut product = if i % 2 == 0 { d * 2 } else { *d };
        if product > 9 {
            product -= 9;
        }
        sum += product;
    }
    let check = (10 - sum % 10) % 10;
    check == digits[9]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_cedulas() {
        assert!(is_valid("1710034065"));
        assert!(is_valid("0926687856"));
    }

    #[test]
    fn rejects_bad_check_digit() {
        assert!(!is_valid("1710034064"));
        assert!(!is_valid("0926687851"));
    }

    #[test]
    fn rejects_bad_province_code() {
        assert!(!is_valid("0010034065"));
        assert!(!is_valid("2510034065"));
        assert!(!is_valid("9926687856"));
    }

    #[test]
    fn rejects_bad_third_digit() {
        // Third digit 6+ marks non-natural-person registries.
        assert!(!is_valid("1769034060"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(!is_valid(""));
        assert!(!is_valid("171003406"));
        assert!(!is_valid("17100340656"));
        assert!(!is_valid("17100A4065"));
        assert!(!is_valid("cedula"));
    }
}
