use rand_core::RngCore;

use super::dns::generate_name;

const PATHS: [&str; 6] = [
    "/",
    "/index.html",
    "/api/v1/items",
    "/static/app.js",
    "/images/logo.png",
    "/search",
];

/// Smallest request this builder can emit; callers bump the packet size to
/// at least this much payload.
pub const MIN_REQUEST_LEN: usize = 128;
pub const MIN_RESPONSE_LEN: usize = 128;

/// HTTP/1.1 request text filling `budget` bytes exactly (padding header).
pub fn build_request(rng: &mut impl RngCore, budget: usize) -> Vec<u8> {
    let host = generate_name(rng);
    let path = PATHS[rng.next_u32() as usize % PATHS.len()];
    let method = if rng.next_u32() % 4 == 0 { "POST" } else { "GET" };
    let base = format!(
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nUser-Agent: flowgen/0.1\r\nAccept: */*\r\n"
    );
    finish_with_padding(base.into_bytes(), budget)
}

/// HTTP/1.1 response text filling `budget` bytes exactly (body padding).
pub fn build_response(rng: &mut impl RngCore, budget: usize) -> Vec<u8> {
    let statuses = ["200 OK", "204 No Content", "404 Not Found"];
    let status = statuses[rng.next_u32() as usize % statuses.len()];
    let head = format!(
        "HTTP/1.1 {status}\r\nServer: flowgen/0.1\r\nContent-Type: text/html\r\n"
    );
    let head = head.into_bytes();
    // header end + body, Content-Length declaring the body that pads to budget
    let skeleton = head.len() + "Content-Length: \r\n\r\n".len();
    let budget = budget.max(skeleton + 2);
    let mut body_len = budget - skeleton - 1;
    // the length field itself takes digits
    loop {
        let total = skeleton + digits(body_len) + body_len;
        if total >= budget {
            body_len -= (total - budget).min(body_len);
            break;
        }
        body_len += budget - total;
    }
    let mut message = head;
    message.extend_from_slice(format!("Content-Length: {body_len}\r\n\r\n").as_bytes());
    message.resize(message.len() + body_len, b'a');
    // digit-boundary slack lands in the body
    if message.len() < budget {
        let extra = budget - message.len();
        message.resize(budget, b'a');
        patch_content_length(&mut message, body_len + extra);
    }
    message
}

/// Rewrites the Content-Length value in place. Only called for the couple
/// of bytes of slack a digit-count change can introduce, so the new value
/// always has at least as many digits available.
fn patch_content_length(message: &mut [u8], value: usize) {
    let text = String::from_utf8_lossy(message);
    if let Some(start) = text.find("Content-Length: ") {
        let digits_start = start + "Content-Length: ".len();
        let formatted = value.to_string();
        let end = digits_start
            + message[digits_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
        if end - digits_start == formatted.len() {
            message[digits_start..end].copy_from_slice(formatted.as_bytes());
        }
    }
}

fn digits(value: usize) -> usize {
    value.to_string().len()
}

fn finish_with_padding(mut message: Vec<u8>, budget: usize) -> Vec<u8> {
    let terminator = b"\r\n";
    let needed = message.len() + terminator.len();
    if budget > needed {
        // X-Pad header absorbs the remaining budget
        let pad_skeleton = "X-Pad: \r\n".len();
        let pad = budget - needed;
        if pad >= pad_skeleton + 1 {
            message.extend_from_slice(b"X-Pad: ");
            message.resize(message.len() + pad - pad_skeleton, b'p');
            message.extend_from_slice(b"\r\n");
        }
    }
    message.extend_from_slice(terminator);
    if message.len() < budget {
        // budget too tight for a padding header; trailing body bytes
        message.resize(budget, b'p');
    }
    message
}
