//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "HTTP agent connector linking attributes to upstream endpoints."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK};
use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use crate::auth::AuthProvider;
use crate::connection::{Connection, HttpResponse, ResponseBody};
use crate::error::TransportError;

/// Follows `rel="next"` links and aggregates page bodies in order.
#[derive(Debug, Clone, Copy)]
pub struct PaginationWalker {
    max_pages: usize,
}

impl PaginationWalker {
    pub fn new(max_pages: usize) -> Self {
        Self {
            max_pages: max_pages.max(1),
        }
    }

    /// Walk the chain starting at `first`. The aggregate keeps the first status and headers.
    ///
    /// A page answering with a non-success status ends the walk without contributing a body.
    pub async fn walk(
        &self,
        connection: &Connection,
        auth: Option<&dyn AuthProvider>,
        first: HttpResponse,
    ) -> Result<HttpResponse, TransportError> {
        let mut pages = vec![first.body.bytes()];
        let mut next = next_link(&first.headers, first.url.as_ref());

        while let Some(url) = next.take() {
            if pages.len() >= self.max_pages {
                warn!(max_pages = self.max_pages, next = %url, "pagination cap reached");
                break;
            }
            debug!(page = pages.len() + 1, url = %url, "fetching next page");
            let credentialed = same_origin(&url, connection.base_url());
            let mut request = connection.request(Method::GET, url);
            match auth {
                Some(auth) if credentialed => {
                    if let Some(header) = auth.authorization().await {
                        request = request.header(AUTHORIZATION, header);
                    }
                }
                Some(_) => debug!("next page is on another origin; omitting credentials"),
                None => {}
            }
            let page = connection.execute(request).await?;
            if !page.is_success() {
                warn!(status = page.status, "page request failed; stopping pagination");
                break;
            }
            next = next_link(&page.headers, page.url.as_ref());
            pages.push(page.body.bytes());
        }

        Ok(HttpResponse {
            status: first.status,
            headers: first.headers,
            body: ResponseBody::Pages(pages),
            url: first.url,
        })
    }
}

/// Target of the first `rel="next"` entry across all `Link` headers.
pub fn next_link(headers: &HeaderMap, base: Option<&Url>) -> Option<Url> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(find_next_target)
        .and_then(|target| match base {
            Some(base) => base.join(target).ok(),
            None => Url::parse(target).ok(),
        })
}

/// Credentials follow a page link only within the agent's own origin.
fn same_origin(url: &Url, base: &Url) -> bool {
    url.origin() == base.origin()
}

fn find_next_target(value: &str) -> Option<&str> {
    let mut rest = value;
    while let Some(open) = rest.find('<') {
        let after_open = &rest[open + 1..];
        let close = after_open.find('>')?;
        let target = &after_open[..close];
        let tail = &after_open[close + 1..];
        let params_end = tail.find('<').unwrap_or(tail.len());
        if tail[..params_end].split(';').any(is_next_relation) {
            return Some(target.trim());
        }
        rest = &tail[params_end..];
    }
    None
}

fn is_next_relation(param: &str) -> bool {
    let Some((key, value)) = param.split_once('=') else {
        return false;
    };
    key.trim().eq_ignore_ascii_case("rel")
        && value
            .trim()
            .trim_end_matches(',')
            .trim()
            .trim_matches('"')
            .split_whitespace()
            .any(|relation| relation.eq_ignore_ascii_case("next"))
}
