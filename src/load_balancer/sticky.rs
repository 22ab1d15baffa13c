//! Sticky session route extraction.
//!
//! A session id such as `8F2A.node1` carries the route of the target that
//! created it after the routing delimiter. With ranked routing the tail is a
//! preference list: `8F2A.node1.node2`.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

use crate::config::StickyConfig;

#[derive(Debug, Clone)]
pub struct StickySessions {
    cookie_names: Vec<String>,
    path_params: Vec<String>,
    ranked: bool,
    delimiter: String,
}

impl StickySessions {
    pub fn new(config: &StickyConfig) -> Self {
        Self {
            path_params: config
                .cookie_names
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            cookie_names: config.cookie_names.clone(),
            ranked: config.ranked_routing,
            delimiter: config.routing_delimiter.clone(),
        }
    }

    pub fn is_ranked(&self) -> bool {
        self.ranked
    }

    /// Session id from the first configured cookie present, falling back to a
    /// `;jsessionid=` style path parameter.
    pub fn session_id<'a>(&self, headers: &'a HeaderMap, path: &'a str) -> Option<&'a str> {
        self.cookie_names
            .iter()
            .find_map(|name| cookie_value(headers, name))
            .or_else(|| self.path_params.iter().find_map(|name| path_param(path, name)))
    }

    /// Routes named by a session id, in preference order.
    pub fn routes<'a>(&self, session_id: &'a str) -> Vec<&'a str> {
        let Some((_, tail)) = session_id.split_once(self.delimiter.as_str()) else {
            return Vec::new();
        };
        if self.ranked {
            tail.split(self.delimiter.as_str())
                .filter(|route| !route.is_empty())
                .collect()
        } else if tail.is_empty() {
            Vec::new()
        } else {
            vec![tail]
        }
    }
}

fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().trim_matches('"'))
        .filter(|value| !value.is_empty())
}

fn path_param<'a>(path: &'a str, name: &str) -> Option<&'a str> {
    path.split('/')
        .flat_map(|segment| segment.split(';').skip(1))
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}
