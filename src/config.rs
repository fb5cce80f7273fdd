use std::path::PathBuf;
use std::time::Duration;

/// Daily-allowance ("diárias") search portal.
pub const DIARIAS_URL: &str = "http://www.portaltransparencia.gov.br/despesasdiarias/";
/// Listing of the downloadable datasets.
pub const DOWNLOADS_URL: &str = "http://portaldatransparencia.gov.br/downloads/";
/// Endpoint serving the dataset archives.
pub const DOWNLOAD_ENDPOINT: &str = "http://arquivos.portaldatransparencia.gov.br/downloads.asp";

/// Search used only to load the organization combo box.
pub const ORGS_PROBE_QUERY: &str = "resultado?consulta=rapida&periodoInicio=14/11/2017&periodoFim=15/11/2017&fase=PAG&codigoOS=63000&codigoFavorecido=";

/// Marker carrying the total page count of a search.
pub const PAGE_COUNT_PATTERN: &str =
    r#"<span class="paginaXdeN">P.gina 1 de ([0-9]+)</span>"#;
/// Dataset name embedded in a listing page's javascript.
pub const DATASET_NAME_PATTERN: &str = r"'&consulta=(.*?)'";
/// One downloadable file in a dataset listing page.
pub const FILE_VARIANT_PATTERN: &str = r#"\{"ano":"([0-9]{4})","mes":"([0-9]{2}|_F)"(,"dia":"([0-9]*)")?(,"tipo":"?(\w*)")?(,"origem":"?(\w*)")?\}"#;

/// Combo value meaning "every organization".
pub const ALL_ORGS_SENTINEL: &str = "TOD";
/// First-cell text of a search that returned nothing.
pub const NO_RESULTS_SENTINEL: &str = "Nenhum documento obedece aos critérios da consulta";
/// Dataset that is frozen upstream and downloaded as a single archive.
pub const SPECIAL_DATASET: &str = "Copa";
/// Month value of the yearly consolidated file.
pub const FINAL_MONTH: &str = "_F";

pub const CHUNK_SIZE: usize = 32 * 1024;
pub const DEFAULT_DELAY_SECS: u64 = 30;
pub const DEFAULT_STALL_SECS: u64 = 300;

/// Settings shared by both scrapers.
#[derive(Debug, Clone)]
pub struct Settings {
    pub out_dir: PathBuf,
    pub delay: Duration,
    pub stall_timeout: Duration,
}
