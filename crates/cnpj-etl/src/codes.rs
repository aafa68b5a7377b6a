//! Registry code translations.
//!
//! Unknown codes pass through as the raw input string; absent codes become
//! the empty string.

/// Registration status. The input is left-padded to two digits first.
pub fn decode_situacao(code: &str) -> String {
    let padded = pad2(code);
    match padded.as_str() {
        "01" => "Nula".into(),
        "02" => "Ativa".into(),
        "03" => "Suspensa".into(),
        "04" => "Inapta".into(),
        "08" => "Baixada".into(),
        _ => code.to_string(),
    }
}

/// Headquarters vs. branch marker.
pub fn decode_matriz_filial(code: &str) -> String {
    match code {
        "1" => "Matriz".into(),
        "2" => "Filial".into(),
        _ => code.to_string(),
    }
}

/// Company size band.
pub fn decode_porte(code: &str) -> String {
    match code {
        "00" => "Não informado".into(),
        "01" => "Microempresa (ME)".into(),
        "03" => "Empresa de Pequeno Porte (EPP)".into(),
        "05" => "Demais".into(),
        _ => code.to_string(),
    }
}

/// Partner kind.
pub fn decode_identificador_socio(code: &str) -> String {
    match code {
        "1" => "Pessoa Jurídica".into(),
        "2" => "Pessoa Física".into(),
        "3" => "Estrangeiro".into(),
        _ => code.to_string(),
    }
}

/// Partner age band.
pub fn decode_faixa_etaria(code: &str) -> String {
    match code {
        "0" => "Não se aplica".into(),
        "1" => "0 a 12 anos".into(),
        "2" => "13 a 20 anos".into(),
        "3" => "21 a 30 anos".into(),
        "4" => "31 a 40 anos".into(),
        "5" => "41 a 50 anos".into(),
        "6" => "51 a 60 anos".into(),
        "7" => "61 a 70 anos".into(),
        "8" => "71 a 80 anos".into(),
        "9" => "Mais de 80 anos".into(),
        _ => code.to_string(),
    }
}

fn pad2(code: &str) -> String {
    if code.len() >= 2 {
        code.to_string()
    } else {
        format!("{code:0>2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn situacao_pads_then_decodes() {
        assert_eq!(decode_situacao("02"), "Ativa");
        assert_eq!(decode_situacao("2"), "Ativa");
        assert_eq!(decode_situacao("08"), "Baixada");
        assert_eq!(decode_situacao("99"), "99");
    }

    #[test]
    fn known_codes_translate_verbatim() {
        assert_eq!(decode_matriz_filial("1"), "Matriz");
        assert_eq!(decode_matriz_filial("2"), "Filial");
        assert_eq!(decode_porte("01"), "Microempresa (ME)");
        assert_eq!(decode_porte("03"), "Empresa de Pequeno Porte (EPP)");
        assert_eq!(decode_identificador_socio("2"), "Pessoa Física");
        assert_eq!(decode_faixa_etaria("9"), "Mais de 80 anos");
        assert_eq!(decode_faixa_etaria("0"), "Não se aplica");
    }

    #[test]
    fn unknown_codes_pass_through() {
        assert_eq!(decode_matriz_filial("7"), "7");
        assert_eq!(decode_porte("42"), "42");
        assert_eq!(decode_identificador_socio("X"), "X");
        assert_eq!(decode_faixa_etaria("q"), "q");
    }
}
