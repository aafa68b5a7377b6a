//! Per-entity document assembly.
//!
//! One document per establishment row, in a fixed field order. String fields
//! are never null: absent values project to `""`. Dates in `YYYYMMDD` form
//! are reformatted to ISO; anything else passes through. The partner list
//! (`QSA`) carries whatever order the engine emitted.

use serde::Serialize;

use crate::codes;

/// A phone record. The third source slot is the fax line.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Telefone {
    pub ddd: String,
    pub numero: String,
    pub is_fax: bool,
}

/// One entry of the partner list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Socio {
    pub nome_socio: String,
    pub cnpj_cpf_socio: String,
    pub qualificacao_socio: String,
    pub data_entrada_sociedade: String,
    pub identificador_socio: String,
    pub faixa_etaria: String,
}

/// The canonical per-establishment document. Field order here is the wire
/// order.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub cnpj: String,
    pub razao_social: String,
    pub nome_fantasia: String,
    pub situacao_cadastral: String,
    pub data_situacao_cadastral: String,
    pub matriz_filial: String,
    pub data_inicio_atividade: String,
    pub cnae_principal: String,
    pub cnaes_secundarios: Vec<String>,
    pub natureza_juridica: String,
    pub tipo_logradouro: String,
    pub logradouro: String,
    pub numero: String,
    pub complemento: String,
    pub bairro: String,
    pub cep: String,
    pub uf: String,
    pub municipio: String,
    pub email: String,
    pub telefones: Vec<Telefone>,
    pub capital_social: String,
    pub porte_empresa: String,
    pub opcao_simples: String,
    pub data_opcao_simples: String,
    pub opcao_mei: String,
    pub data_opcao_mei: String,
    #[serde(rename = "QSA")]
    pub qsa: Vec<Socio>,
}

/// Joined row for one establishment, as it comes back from the engine.
/// `None` covers both SQL null and the empty string.
#[derive(Debug, Clone, Default)]
pub struct EstablishmentRow {
    pub cnpj_basico: Option<String>,
    pub cnpj_ordem: Option<String>,
    pub cnpj_dv: Option<String>,
    pub identificador_matriz_filial: Option<String>,
    pub nome_fantasia: Option<String>,
    pub situacao_cadastral: Option<String>,
    pub data_situacao_cadastral: Option<String>,
    pub data_inicio_atividade: Option<String>,
    pub cnae_principal: Option<String>,
    pub cnaes_secundarios: Option<String>,
    pub tipo_logradouro: Option<String>,
    pub logradouro: Option<String>,
    pub numero: Option<String>,
    pub complemento: Option<String>,
    pub bairro: Option<String>,
    pub cep: Option<String>,
    pub uf: Option<String>,
    pub ddd1: Option<String>,
    pub telefone1: Option<String>,
    pub ddd2: Option<String>,
    pub telefone2: Option<String>,
    pub ddd_fax: Option<String>,
    pub fax: Option<String>,
    pub correio_eletronico: Option<String>,
    pub razao_social: Option<String>,
    pub capital_social: Option<String>,
    pub porte_empresa: Option<String>,
    pub natureza_juridica: Option<String>,
    pub municipio: Option<String>,
    pub opcao_simples: Option<String>,
    pub data_opcao_simples: Option<String>,
    pub opcao_mei: Option<String>,
    pub data_opcao_mei: Option<String>,
}

/// Joined partner row before decoding.
#[derive(Debug, Clone, Default)]
pub struct SocioRow {
    pub nome_socio: Option<String>,
    pub cnpj_cpf_socio: Option<String>,
    pub qualificacao_socio: Option<String>,
    pub data_entrada_sociedade: Option<String>,
    pub identificador_socio: Option<String>,
    pub faixa_etaria: Option<String>,
}

/// `YYYYMMDD` → `YYYY-MM-DD`; anything else (including empty) unchanged.
pub fn reformat_date(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() == 8 && bytes.iter().all(|b| b.is_ascii_digit()) {
        format!("{}-{}-{}", &value[..4], &value[4..6], &value[6..8])
    } else {
        value.to_string()
    }
}

fn text(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

fn date(value: &Option<String>) -> String {
    value.as_deref().map(reformat_date).unwrap_or_default()
}

fn decode(value: &Option<String>, decoder: fn(&str) -> String) -> String {
    value.as_deref().map(decoder).unwrap_or_default()
}

/// Up to three phone records; a slot is kept when either its area code or its
/// number is present.
fn telefones(row: &EstablishmentRow) -> Vec<Telefone> {
    let slots = [
        (&row.ddd1, &row.telefone1, false),
        (&row.ddd2, &row.telefone2, false),
        (&row.ddd_fax, &row.fax, true),
    ];
    slots
        .into_iter()
        .filter(|(ddd, numero, _)| ddd.is_some() || numero.is_some())
        .map(|(ddd, numero, is_fax)| Telefone {
            ddd: text(ddd),
            numero: text(numero),
            is_fax,
        })
        .collect()
}

fn split_cnaes(value: &Option<String>) -> Vec<String> {
    match value {
        Some(raw) if !raw.is_empty() => raw.split(',').map(|s| s.to_string()).collect(),
        _ => Vec::new(),
    }
}

pub fn build_socio(row: &SocioRow) -> Socio {
    Socio {
        nome_socio: text(&row.nome_socio),
        cnpj_cpf_socio: text(&row.cnpj_cpf_socio),
        qualificacao_socio: text(&row.qualificacao_socio),
        data_entrada_sociedade: date(&row.data_entrada_sociedade),
        identificador_socio: decode(&row.identificador_socio, codes::decode_identificador_socio),
        faixa_etaria: decode(&row.faixa_etaria, codes::decode_faixa_etaria),
    }
}

pub fn build_document(row: &EstablishmentRow, qsa: Vec<Socio>) -> Document {
    Document {
        cnpj: format!(
            "{}{}{}",
            text(&row.cnpj_basico),
            text(&row.cnpj_ordem),
            text(&row.cnpj_dv)
        ),
        razao_social: text(&row.razao_social),
        nome_fantasia: text(&row.nome_fantasia),
        situacao_cadastral: decode(&row.situacao_cadastral, codes::decode_situacao),
        data_situacao_cadastral: date(&row.data_situacao_cadastral),
        matriz_filial: decode(&row.identificador_matriz_filial, codes::decode_matriz_filial),
        data_inicio_atividade: date(&row.data_inicio_atividade),
        cnae_principal: text(&row.cnae_principal),
        cnaes_secundarios: split_cnaes(&row.cnaes_secundarios),
        natureza_juridica: text(&row.natureza_juridica),
        tipo_logradouro: text(&row.tipo_logradouro),
        logradouro: text(&row.logradouro),
        numero: text(&row.numero),
        complemento: text(&row.complemento),
        bairro: text(&row.bairro),
        cep: text(&row.cep),
        uf: text(&row.uf),
        municipio: text(&row.municipio),
        email: text(&row.correio_eletronico),
        telefones: telefones(row),
        capital_social: text(&row.capital_social),
        porte_empresa: decode(&row.porte_empresa, codes::decode_porte),
        opcao_simples: text(&row.opcao_simples),
        data_opcao_simples: date(&row.data_opcao_simples),
        opcao_mei: text(&row.opcao_mei),
        data_opcao_mei: date(&row.data_opcao_mei),
        qsa,
    }
}
