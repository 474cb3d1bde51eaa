//! Parseo de salidas multi-archivo de un modelo a un árbol `ruta -> contenido`.
//!
//! Formatos reconocidos:
//! - ruta en la línea de apertura: ```` ```python app/main.py ````
//! - ruta en la línea anterior a la cerca: `**app/main.py**` o `File: app/main.py`
//!
//! Bloques sin ruta, o con rutas absolutas o con `..`, se descartan.

use std::collections::BTreeMap;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

static INLINE_PATH: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]+([\w\-./]+)[ \t]*\n(.*?)```").ok());
static HEADER_PATH: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?m)^[*`#\s]*(?:[Ff]ile:\s*)?([\w\-./]+\.[A-Za-z0-9]+)[*`\s]*\n```[^\n]*\n((?s:.*?))```").ok()
});

fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
    && !path.starts_with('/')
    && !path.ends_with('/')
    && path.split('/').all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

pub fn parse_file_blocks(text: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for re in [&INLINE_PATH, &HEADER_PATH].into_iter().filter_map(|re| re.as_ref()) {
        for caps in re.captures_iter(text) {
            let path = caps[1].trim_start_matches("./").to_string();
            if !is_safe_relative(&path) {
                debug!("descartando bloque con ruta no válida: {path}");
                continue;
            }
            let body = format!("{}\n", caps[2].trim_end());
            files.entry(path).or_insert(body);
        }
    }
    files
}
