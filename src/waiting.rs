//! The page served while a route's workloads are waking up

use crate::readiness::ReadinessReport;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};

/// Seconds between status polls, also sent as `Retry-After`
pub const POLL_INTERVAL_SECS: u64 = 2;

/// Render the waiting page for a request that hit a sleeping route
pub fn render(status_path: &str, host: &str, path: &str, report: &ReadinessReport) -> String {
    let poll_url = format!(
        "{}?host={}&path={}",
        status_path,
        urlencoding::encode(host),
        urlencoding::encode(path)
    );

    let items: String = report
        .details
        .iter()
        .map(|d| {
            format!(
                r#"<li><span class="name">{}</span><span class="state {}">{}</span></li>"#,
                escape_html(&d.name),
                d.status.as_str().to_ascii_lowercase(),
                d.status
            )
        })
        .collect();

    WAITING_HTML
        .replace("{{ITEMS}}", &items)
        .replace("{{POLL_URL}}", &script_string(&poll_url))
        .replace("{{INTERVAL_MS}}", &(POLL_INTERVAL_SECS * 1000).to_string())
}

/// 503 response carrying the waiting page
pub fn waiting_response(
    status_path: &str,
    host: &str,
    path: &str,
    report: &ReadinessReport,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = render(status_path, host, path, report);
    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;

    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(RETRY_AFTER, HeaderValue::from(POLL_INTERVAL_SECS));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// JSON string literal safe to embed in an inline script
fn script_string(s: &str) -> String {
    serde_json::Value::String(s.to_string())
        .to_string()
        .replace("</", "<\\/")
}

const WAITING_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Waking up...</title>
<style>
  body { margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center;
         background: #0f172a; color: #e2e8f0; font-family: system-ui, -apple-system, sans-serif; }
  .card { padding: 2rem 2.5rem; border: 1px solid #1e293b; border-radius: 12px; background: #111827; min-width: 320px; }
  h1 { font-size: 1.25rem; margin: 0 0 0.5rem; }
  p { color: #94a3b8; margin: 0 0 1.25rem; }
  ul { list-style: none; padding: 0; margin: 0; }
  li { display: flex; justify-content: space-between; padding: 0.4rem 0; border-top: 1px solid #1e293b; }
  .state { font-weight: 600; }
  .ready { color: #4ade80; }
  .scaling { color: #facc15; }
  .sleep { color: #60a5fa; }
  .error, .unknown { color: #f87171; }
</style>
</head>
<body>
<div class="card">
  <h1>Waking up...</h1>
  <p>This application was asleep. It will load as soon as it is ready.</p>
  <ul id="workloads">{{ITEMS}}</ul>
</div>
<script>
(function () {
  var url = {{POLL_URL}};
  function esc(s) {
    var d = document.createElement('div');
    d.textContent = s;
    return d.innerHTML;
  }
  function poll() {
    fetch(url, { cache: 'no-store' })
      .then(function (r) { return r.json(); })
      .then(function (data) {
        if (data.status === 'ready') {
          window.location.reload();
          return;
        }
        if (Array.isArray(data.details)) {
          document.getElementById('workloads').innerHTML = data.details.map(function (d) {
            return '<li><span class="name">' + esc(d.name) + '</span><span class="state ' +
              esc(String(d.status).toLowerCase()) + '">' + esc(d.status) + '</span></li>';
          }).join('');
        }
      })
      .catch(function () {})
      .then(function () { setTimeout(poll, {{INTERVAL_MS}}); });
  }
  setTimeout(poll, {{INTERVAL_MS}});
})();
</script>
</body>
</html>
"##;
