//! Forward-only XML token scanner
//!
//! Wraps the quick-xml async reader and reduces its event set to the four
//! tokens the extractor cares about. Only the current element's attributes
//! are held in memory; character data is reported but never buffered.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::io::AsyncBufRead;

use super::error::{ExtractError, Result};

/// One step of the XML stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Opening tag (self-closing tags are expanded into start + end)
    ElementStart { name: String, attributes: Attributes },
    /// Closing tag
    ElementEnd { name: String },
    /// Text, CDATA, comments, processing instructions and declarations
    CharacterData,
    /// Input exhausted, or the root element has closed
    EndOfStream,
}

/// Attributes of a single element, in document order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Attributes(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Lazy token sequence over an async byte stream
pub struct Scanner<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    token_start: usize,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> Scanner<R> {
    pub fn new(source: R) -> Self {
        let mut reader = Reader::from_reader(source);
        reader.trim_text(true);
        reader.expand_empty_elements(true);

        Self {
            reader,
            buf: Vec::new(),
            depth: 0,
            token_start: 0,
            finished: false,
        }
    }

    /// Byte offset where the most recently returned token started
    pub fn position(&self) -> usize {
        self.token_start
    }

    /// Read the next token.
    ///
    /// After `EndOfStream` or an error every further call returns `EndOfStream`.
    pub async fn next_token(&mut self) -> Result<Token> {
        if self.finished {
            return Ok(Token::EndOfStream);
        }

        self.buf.clear();
        self.token_start = self.reader.buffer_position();

        let event = match self.reader.read_event_into_async(&mut self.buf).await {
            Ok(event) => event,
            Err(e) => {
                self.finished = true;
                return Err(ExtractError::from_xml(self.reader.buffer_position(), e));
            }
        };

        match event {
            Event::Start(ref e) => {
                self.depth += 1;
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                let attributes = match read_attributes(e, self.token_start) {
                    Ok(attributes) => attributes,
                    Err(err) => {
                        self.finished = true;
                        return Err(err);
                    }
                };
                Ok(Token::ElementStart { name, attributes })
            }
            Event::End(ref e) => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    // Root closed; whatever follows is not read
                    self.finished = true;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                Ok(Token::ElementEnd { name })
            }
            Event::Eof => {
                self.finished = true;
                if self.depth > 0 {
                    return Err(ExtractError::Xml {
                        offset: self.reader.buffer_position(),
                        message: format!(
                            "unexpected end of input with {} element(s) still open",
                            self.depth
                        ),
                    });
                }
                Ok(Token::EndOfStream)
            }
            // Empty is expanded by the reader; the rest carries nothing we read
            _ => Ok(Token::CharacterData),
        }
    }
}

fn read_attributes(e: &BytesStart<'_>, offset: usize) -> Result<Attributes> {
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| ExtractError::from_xml(offset, err.into()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ExtractError::from_xml(offset, err))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Attributes(attributes))
}
