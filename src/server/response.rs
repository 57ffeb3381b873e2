use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rmcp::model::{CallToolResult, Content};

/// Ordered text parts followed by ordered PNG parts, as returned by tools
/// that produce display output rather than structured data.
#[derive(Debug, Default)]
pub struct RichContent {
    pub texts: Vec<String>,
    pub images: Vec<Vec<u8>>,
}

/// Serialises rich content into the framework's content list: every text
/// item first, then every image item, both in the order supplied.
pub(crate) fn rich_content_result(content: RichContent) -> CallToolResult {
    let mut contents: Vec<Content> = content.texts.into_iter().map(Content::text).collect();
    contents.extend(
        content
            .images
            .into_iter()
            .map(|png| Content::image(STANDARD.encode(png), "image/png")),
    );
    ensure_nonempty_contents(&mut contents);
    CallToolResult::success(contents)
}

fn ensure_nonempty_contents(contents: &mut Vec<Content>) {
    if contents.is_empty() {
        contents.push(Content::text(String::new()));
    }
}
