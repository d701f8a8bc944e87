use std::path::Path;

use skiff_protocol::{BrowserObservation, BrowserPage};

/// Browser command for visiting `url`. Anything that is not http(s) is
/// treated as a file relative to the sandbox working directory.
pub fn goto_command(url: &str, working_dir: &str) -> (String, String) {
    let target = if url.starts_with("http") || url.starts_with("file://") {
        url.to_owned()
    } else {
        format!("file://{}", Path::new(working_dir).join(url).display())
    };
    let literal = serde_json::Value::String(target.clone()).to_string();
    (format!("goto({literal})"), target)
}

pub fn page_observation(page: BrowserPage, last_action: &str) -> BrowserObservation {
    BrowserObservation {
        content: page.text_content,
        url: page.url,
        screenshot: page.screenshot,
        open_pages_urls: page.open_pages_urls,
        active_page_index: page.active_page_index,
        axtree_txt: page.axtree_txt,
        focused_element_bid: page.focused_element_bid,
        last_browser_action: last_action.to_owned(),
        error: !page.last_action_error.is_empty(),
        last_browser_action_error: page.last_action_error,
    }
}
