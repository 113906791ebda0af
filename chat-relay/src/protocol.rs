use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// First line the server sends on every new connection.
pub const USERNAME_PROMPT: &str = "Enter your username:";

/// Reserved prefix that marks a membership record.
pub const MEMBERS_PREFIX: &str = "MEMBERS:";

/// Literal a client sends to leave the chat.
pub const DISCONNECT_TOKEN: &str = "/disconnect";

/// Label used instead of the username when a message is echoed to its sender.
pub const ECHO_LABEL: &str = "You";

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A line received from a client after the username handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientLine<'a> {
    Disconnect,
    Chat(&'a str),
}

impl<'a> ClientLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        if line == DISCONNECT_TOKEN {
            ClientLine::Disconnect
        } else {
            ClientLine::Chat(line)
        }
    }
}

/// A line received from the server, as a client sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    Prompt,
    Members(Vec<String>),
    Text(String),
}

impl ServerLine {
    pub fn parse(line: &str) -> Self {
        if line == USERNAME_PROMPT {
            return ServerLine::Prompt;
        }
        match decode_membership(line) {
            Some(names) => ServerLine::Members(names),
            None => ServerLine::Text(line.to_string()),
        }
    }
}

pub fn echo_line(body: &str) -> String {
    format!("{ECHO_LABEL}: {body}")
}

pub fn attributed_line(sender: &str, body: &str) -> String {
    format!("{sender}: {body}")
}

/// Builds a membership record such as `MEMBERS:alice,bob,`.
///
/// Every name is followed by a comma, including the last one. Empty names are
/// skipped so they never show up as blank entries on the client.
pub fn encode_membership<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter(|name| !name.is_empty())
        .fold(String::from(MEMBERS_PREFIX), |mut record, name| {
            record.push_str(name);
            record.push(',');
            record
        })
}

/// Parses a membership record, returning `None` for any other kind of line.
pub fn decode_membership(line: &str) -> Option<Vec<String>> {
    let list = line.strip_prefix(MEMBERS_PREFIX)?;
    Some(
        list.split(',')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Reads one line with its terminator stripped. `Ok(None)` means end of stream.
///
/// A final fragment without a trailing newline is still returned as a line.
/// Bytes that are not UTF-8 are replaced rather than rejected. `buf` keeps any
/// partial line if the future is dropped mid-read, so this can be raced in
/// `select!` as long as the same buffer is passed back in.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let bytes = reader.read_until(b'\n', buf).await?;
    if bytes == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(LINE_ENDINGS)
        .to_string();
    buf.clear();
    Ok(Some(line))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // One buffer per line so a recipient never sees a body without its newline.
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn membership_record_has_trailing_comma() {
        assert_eq!(encode_membership(["alice", "bob"]), "MEMBERS:alice,bob,");
        assert_eq!(encode_membership(Vec::<&str>::new()), "MEMBERS:");
    }

    #[test]
    fn membership_skips_empty_names() {
        assert_eq!(encode_membership(["", "alice", ""]), "MEMBERS:alice,");
        assert_eq!(
            decode_membership("MEMBERS:,alice,,bob,"),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[test]
    fn membership_record_decodes_to_same_set() {
        let names: BTreeSet<String> = ["alice", "bob"].into_iter().map(String::from).collect();
        let record = encode_membership(names.iter().map(String::as_str));
        let decoded: BTreeSet<String> = decode_membership(&record)
            .expect("membership record")
            .into_iter()
            .collect();
        assert_eq!(decoded, names);
    }

    #[test]
    fn plain_text_is_not_membership() {
        assert_eq!(decode_membership("alice: MEMBERS:bob"), None);
        assert_eq!(
            ServerLine::parse("bob: hi"),
            ServerLine::Text("bob: hi".to_string())
        );
        assert_eq!(ServerLine::parse(USERNAME_PROMPT), ServerLine::Prompt);
        assert_eq!(ServerLine::parse("MEMBERS:"), ServerLine::Members(Vec::new()));
    }

    #[test]
    fn disconnect_token_matches_exactly() {
        assert_eq!(ClientLine::parse("/disconnect"), ClientLine::Disconnect);
        assert_eq!(
            ClientLine::parse("/disconnect "),
            ClientLine::Chat("/disconnect ")
        );
        assert_eq!(
            ClientLine::parse("/DISCONNECT"),
            ClientLine::Chat("/DISCONNECT")
        );
        assert_eq!(ClientLine::parse(""), ClientLine::Chat(""));
    }

    #[test]
    fn broadcast_lines_are_labelled() {
        assert_eq!(echo_line("hello"), "You: hello");
        assert_eq!(attributed_line("alice", "hello"), "alice: hello");
    }

    #[tokio::test]
    async fn lines_are_framed_by_newlines() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buf = Vec::new();

        write_line(&mut writer, "hello").await.expect("write line");
        writer.write_all(b"crlf\r\n\npartial").await.expect("write raw");
        drop(writer);

        let mut lines = Vec::new();
        while let Some(line) = read_line(&mut reader, &mut buf).await.expect("read line") {
            lines.push(line);
        }
        assert_eq!(lines, ["hello", "crlf", "", "partial"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_rejected() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buf = Vec::new();

        writer.write_all(b"caf\xe9\nnext\n").await.expect("write raw");

        let first = read_line(&mut reader, &mut buf).await.expect("read line");
        assert_eq!(first.as_deref(), Some("caf\u{FFFD}"));
        let second = read_line(&mut reader, &mut buf).await.expect("read line");
        assert_eq!(second.as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn interrupted_read_resumes_with_partial_line() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buf = Vec::new();

        writer.write_all(b"MEMBERS:ali").await.expect("write head");
        tokio::select! {
            line = read_line(&mut reader, &mut buf) => panic!("line completed early: {line:?}"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        assert_eq!(buf, b"MEMBERS:ali");

        writer.write_all(b"ce,bob,\n").await.expect("write tail");
        let line = read_line(&mut reader, &mut buf).await.expect("read line");
        assert_eq!(line.as_deref(), Some("MEMBERS:alice,bob,"));
        assert!(buf.is_empty());
    }
}
