//! Streaming Cobertura package extraction
//!
//! The scan folds tokens into packages and hands each one to the channel the
//! moment its closing tag is read, so memory stays bounded by the largest
//! single package rather than the whole report.

use std::str::FromStr;

use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ExtractError, Result};
use super::scanner::{Attributes, Scanner, Token};
use super::{percent_from_rate, Coverage, Package};

/// Counters for one completed extraction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub packages: usize,
    pub classes: usize,
    pub lines: usize,
}

/// Extract packages from a Cobertura report, sending each on `packages`.
///
/// The sender is dropped when this returns, which closes the channel for
/// every outcome. Cancellation is checked before each token and before each
/// send; a cancelled run returns [`ExtractError::Cancelled`].
pub async fn extract<R>(
    source: R,
    packages: mpsc::Sender<Package>,
    cancel: CancellationToken,
) -> Result<ExtractStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut scanner = Scanner::new(source);
    let mut extractor = Extractor::default();

    loop {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(sent = extractor.stats.packages, "extraction cancelled");
                return Err(ExtractError::Cancelled);
            }
            token = scanner.next_token() => token?,
        };

        let done = token == Token::EndOfStream;
        if let Some(package) = extractor.apply(token, scanner.position())? {
            send(&packages, package, &cancel).await?;
        }
        if done {
            break;
        }
    }

    let stats = extractor.stats;
    info!(
        packages = stats.packages,
        classes = stats.classes,
        lines = stats.lines,
        "coverage extraction finished"
    );
    Ok(stats)
}

async fn send(
    packages: &mpsc::Sender<Package>,
    package: Package,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = package.path.clone();
    let files = package.files.len();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!(package = %path, "extraction cancelled before send");
            Err(ExtractError::Cancelled)
        }
        sent = packages.send(package) => match sent {
            Ok(()) => {
                debug!(package = %path, files, "package emitted");
                Ok(())
            }
            Err(_) => {
                warn!(package = %path, "package receiver dropped");
                Err(ExtractError::Cancelled)
            }
        },
    }
}

/// Token-by-token fold of the package/class/line structure
#[derive(Debug, Default)]
pub struct Extractor {
    package: Option<Package>,
    class: Option<Coverage>,
    method_depth: usize,
    stats: ExtractStats,
}

impl Extractor {
    /// Apply one token; returns the package whose closing tag it was, if any.
    pub fn apply(&mut self, token: Token, offset: usize) -> Result<Option<Package>> {
        match token {
            Token::ElementStart { name, attributes } => {
                match name.as_str() {
                    "package" => self.open_package(&attributes, offset)?,
                    "class" => self.open_class(&attributes, offset)?,
                    "method" if self.class.is_some() => self.method_depth += 1,
                    // Method-level lines repeat the class-level ones
                    "line" if self.method_depth == 0 => self.record_line(&attributes, offset)?,
                    _ => {}
                }
                Ok(None)
            }
            Token::ElementEnd { name } => match name.as_str() {
                "method" if self.method_depth > 0 => {
                    self.method_depth -= 1;
                    Ok(None)
                }
                "class" => {
                    self.close_class(offset)?;
                    Ok(None)
                }
                "package" => self.close_package(offset).map(Some),
                _ => Ok(None),
            },
            Token::CharacterData => Ok(None),
            Token::EndOfStream => match &self.package {
                Some(package) => Err(ExtractError::structure(
                    offset,
                    format!("package '{}' is never closed", package.path),
                )),
                None => Ok(None),
            },
        }
    }

    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    fn open_package(&mut self, attributes: &Attributes, offset: usize) -> Result<()> {
        if let Some(open) = &self.package {
            return Err(ExtractError::structure(
                offset,
                format!("package nested inside package '{}'", open.path),
            ));
        }

        let path = required(attributes, "package", "name", offset)?;
        self.package = Some(Package::new(path));
        Ok(())
    }

    fn open_class(&mut self, attributes: &Attributes, offset: usize) -> Result<()> {
        if self.package.is_none() {
            return Err(ExtractError::structure(offset, "class outside of a package"));
        }
        if let Some(open) = &self.class {
            return Err(ExtractError::structure(
                offset,
                format!("class nested inside class '{}'", open.file),
            ));
        }

        let file = attributes
            .get("name")
            .or_else(|| attributes.get("filename"))
            .ok_or_else(|| ExtractError::structure(offset, "class is missing a name attribute"))?;

        let rate: f64 = parse(attributes, "class", "line-rate", offset)?;
        let percent = percent_from_rate(rate).ok_or_else(|| {
            ExtractError::structure(
                offset,
                format!("class '{}' has line-rate {} outside [0, 1]", file, rate),
            )
        })?;

        self.class = Some(Coverage {
            file: file.to_string(),
            percent,
            ..Default::default()
        });
        Ok(())
    }

    fn record_line(&mut self, attributes: &Attributes, offset: usize) -> Result<()> {
        let number: u32 = parse(attributes, "line", "number", offset)?;
        let hits: u64 = parse(attributes, "line", "hits", offset)?;

        let class = self
            .class
            .as_mut()
            .ok_or_else(|| ExtractError::structure(offset, format!("line {} outside of a class", number)))?;

        class.lines_total += 1;
        if hits == 0 {
            class.uncovered_lines.push(number);
        } else {
            class.lines_covered += 1;
        }
        self.stats.lines += 1;
        Ok(())
    }

    fn close_class(&mut self, offset: usize) -> Result<()> {
        let class = self
            .class
            .take()
            .ok_or_else(|| ExtractError::structure(offset, "class closed without being opened"))?;
        let package = self
            .package
            .as_mut()
            .ok_or_else(|| ExtractError::structure(offset, "class closed outside of a package"))?;

        package.files.push(class);
        self.method_depth = 0;
        self.stats.classes += 1;
        Ok(())
    }

    fn close_package(&mut self, offset: usize) -> Result<Package> {
        if let Some(open) = &self.class {
            return Err(ExtractError::structure(
                offset,
                format!("package closed while class '{}' is open", open.file),
            ));
        }

        let package = self
            .package
            .take()
            .ok_or_else(|| ExtractError::structure(offset, "package closed without being opened"))?;
        self.stats.packages += 1;
        Ok(package)
    }
}

fn required<'a>(
    attributes: &'a Attributes,
    element: &str,
    key: &str,
    offset: usize,
) -> Result<&'a str> {
    attributes.get(key).ok_or_else(|| {
        ExtractError::structure(offset, format!("{} is missing the {} attribute", element, key))
    })
}

fn parse<T: FromStr>(attributes: &Attributes, element: &str, key: &str, offset: usize) -> Result<T> {
    let raw = required(attributes, element, key, offset)?;
    raw.trim().parse().map_err(|_| {
        ExtractError::structure(
            offset,
            format!("{} has an invalid {} value '{}'", element, key, raw),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0"?>
<coverage line-rate="0.75">
    <sources><source>/work</source></sources>
    <packages>
        <package name="app" line-rate="0.75">
            <classes>
                <class name="main.py" filename="app/main.py" line-rate="0.75">
                    <methods/>
                    <lines>
                        <line number="1" hits="1"/>
                        <line number="2" hits="0"/>
                        <line number="3" hits="4"/>
                        <line number="9" hits="0"/>
                    </lines>
                </class>
                <class name="util.py" filename="app/util.py" line-rate="1">
                    <lines><line number="1" hits="2"/></lines>
                </class>
            </classes>
        </package>
        <package name="app.empty" line-rate="1">
            <classes/>
        </package>
    </packages>
</coverage>"#;

    async fn run(xml: &'static str) -> (Result<ExtractStats>, Vec<Package>) {
        let (tx, mut rx) = mpsc::channel(8);
        let result = extract(xml.as_bytes(), tx, CancellationToken::new()).await;

        let mut packages = Vec::new();
        while let Some(package) = rx.recv().await {
            packages.push(package);
        }
        (result, packages)
    }

    #[tokio::test]
    async fn test_extract_packages_in_document_order() {
        let (result, packages) = run(REPORT).await;

        let stats = result.unwrap();
        assert_eq!(
            stats,
            ExtractStats {
                packages: 2,
                classes: 2,
                lines: 5
            }
        );

        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].path, "app");
        assert_eq!(packages[1], Package::new("app.empty"));

        let main = &packages[0].files[0];
        assert_eq!(main.file, "main.py");
        assert_eq!(main.percent, 75);
        assert_eq!(main.uncovered_lines, vec![2, 9]);
        assert_eq!(main.lines_total, 4);
        assert_eq!(main.lines_covered, 2);

        assert_eq!(packages[0].files[1].file, "util.py");
        assert_eq!(packages[0].files[1].percent, 100);
        assert!(packages[0].files[1].uncovered_lines.is_empty());
    }

    #[tokio::test]
    async fn test_uncovered_lines_keep_arrival_order() {
        let (result, packages) = run(
            r#"<coverage><packages><package name="p"><classes>
                <class name="x.py" line-rate="0">
                    <lines>
                        <line number="30" hits="0"/>
                        <line number="4" hits="0"/>
                        <line number="12" hits="0"/>
                    </lines>
                </class>
            </classes></package></packages></coverage>"#,
        )
        .await;

        result.unwrap();
        assert_eq!(packages[0].files[0].uncovered_lines, vec![30, 4, 12]);
    }

    #[tokio::test]
    async fn test_percent_comes_from_line_rate_not_lines() {
        let (result, packages) = run(
            r#"<coverage><packages><package name="p"><classes>
                <class name="x.py" line-rate="0.999">
                    <lines><line number="1" hits="0"/></lines>
                </class>
            </classes></package></packages></coverage>"#,
        )
        .await;

        result.unwrap();
        assert_eq!(packages[0].files[0].percent, 99);
    }

    #[tokio::test]
    async fn test_method_lines_are_not_counted_twice() {
        let (result, packages) = run(
            r#"<coverage><packages><package name="com.acme"><classes>
                <class name="Foo" filename="com/acme/Foo.java" line-rate="0.5">
                    <methods>
                        <method name="bar" signature="()V" line-rate="0.5">
                            <lines>
                                <line number="3" hits="1"/>
                                <line number="4" hits="0"/>
                            </lines>
                        </method>
                    </methods>
                    <lines>
                        <line number="3" hits="1"/>
                        <line number="4" hits="0"/>
                    </lines>
                </class>
            </classes></package></packages></coverage>"#,
        )
        .await;

        assert_eq!(result.unwrap().lines, 2);
        assert_eq!(packages[0].files[0].uncovered_lines, vec![4]);
        assert_eq!(packages[0].files[0].lines_total, 2);
    }

    #[tokio::test]
    async fn test_class_without_name_uses_filename() {
        let (result, packages) = run(
            r#"<coverage><packages><package name="p"><classes>
                <class filename="src/lib.rs" line-rate="0.5"/>
            </classes></package></packages></coverage>"#,
        )
        .await;

        result.unwrap();
        assert_eq!(packages[0].files[0].file, "src/lib.rs");
    }

    #[tokio::test]
    async fn test_missing_line_rate_is_structural_error() {
        let (result, packages) = run(
            r#"<coverage><packages>
                <package name="ok"><classes/></package>
                <package name="bad"><classes><class name="x.py"></class></classes></package>
            </packages></coverage>"#,
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ExtractError::Structure { .. }));
        assert!(err.to_string().contains("line-rate"));
        assert_eq!(packages, vec![Package::new("ok")]);
    }

    #[tokio::test]
    async fn test_invalid_numbers_are_structural_errors() {
        let (result, _) = run(
            r#"<coverage><packages><package name="p"><classes>
                <class name="x.py" line-rate="0.5"><lines><line number="ten" hits="0"/></lines></class>
            </classes></package></packages></coverage>"#,
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("invalid number value 'ten'"));

        let (result, _) = run(
            r#"<coverage><packages><package name="p"><classes>
                <class name="x.py" line-rate="1.7"></class>
            </classes></package></packages></coverage>"#,
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("outside [0, 1]"));
    }

    #[tokio::test]
    async fn test_nesting_violations() {
        let (result, _) = run(
            r#"<coverage><package name="a"><package name="b"></package></package></coverage>"#,
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("nested inside package 'a'"));

        let (result, _) = run(r#"<coverage><classes><class name="x" line-rate="1"/></classes></coverage>"#).await;
        assert!(result.unwrap_err().to_string().contains("class outside of a package"));

        let (result, _) = run(r#"<coverage><package name="a"><line number="1" hits="0"/></package></coverage>"#).await;
        assert!(result.unwrap_err().to_string().contains("line 1 outside of a class"));

        let (result, _) = run(
            r#"<coverage><package name="a"><class name="x.py" line-rate="1"><class name="y.py" line-rate="1"/></class></package></coverage>"#,
        )
        .await;
        assert!(result.unwrap_err().to_string().contains("class nested inside class 'x.py'"));
    }

    #[tokio::test]
    async fn test_unknown_elements_are_ignored() {
        let (result, packages) = run(
            r#"<coverage><generator tool="x"/><packages><package name="p" extra="1">
                <notes>anything <b>here</b></notes>
                <classes><class name="x.py" line-rate="1"><lines><line number="1" hits="1"><conditions/></line></lines></class></classes>
            </package></packages></coverage>"#,
        )
        .await;

        result.unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].files.len(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = extract(REPORT.as_bytes(), tx, cancel).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_extraction() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = extract(REPORT.as_bytes(), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[test]
    fn test_package_cannot_close_over_open_class() {
        let mut extractor = Extractor::default();
        let open = |name: &str, attributes: &[(&str, &str)]| Token::ElementStart {
            name: name.to_string(),
            attributes: attributes.iter().copied().collect(),
        };

        extractor.apply(open("package", &[("name", "p")]), 0).unwrap();
        extractor
            .apply(open("class", &[("name", "x.py"), ("line-rate", "0.5")]), 10)
            .unwrap();

        let err = extractor
            .apply(
                Token::ElementEnd {
                    name: "package".to_string(),
                },
                40,
            )
            .unwrap_err();
        assert!(err.to_string().contains("package closed while class 'x.py' is open"));
        assert_eq!(err.offset(), Some(40));
    }

    #[test]
    fn test_extractor_rejects_unclosed_package_at_end() {
        let mut extractor = Extractor::default();
        extractor
            .apply(
                Token::ElementStart {
                    name: "package".to_string(),
                    attributes: [("name", "p")].into_iter().collect(),
                },
                0,
            )
            .unwrap();

        let err = extractor.apply(Token::EndOfStream, 20).unwrap_err();
        assert_eq!(err.offset(), Some(20));
        assert_eq!(extractor.stats().packages, 0);
    }
}
