//! JUnit XML artifact model.
//!
//! The orchestrator reports one suite per phase (`operator`, `job`). Suites
//! are fully sorted before serialization so repeated runs with the same
//! inputs produce byte-identical artifacts, and every piece of test output
//! is censored before it is written.

use std::io::Cursor;

use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use thiserror::Error;

use crate::censor::DynamicCensor;

/// Error serializing a JUnit document.
#[derive(Debug, Error)]
pub enum JunitError {
    /// The XML writer failed.
    #[error("could not write JUnit XML: {0}")]
    Write(std::io::Error),
}

fn xml_err<E>(err: E) -> JunitError
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    JunitError::Write(std::io::Error::other(err))
}

/// Top-level collection of test suites.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuites {
    /// The suites in the document.
    pub suites: Vec<TestSuite>,
}

/// A single named suite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestSuite {
    /// Suite name.
    pub name: String,
    /// Total number of tests.
    pub num_tests: u32,
    /// Number of failed tests.
    pub num_failed: u32,
    /// Suite duration in seconds.
    pub duration_seconds: f64,
    /// Named properties attached to the suite.
    pub properties: Vec<TestSuiteProperty>,
    /// Nested child suites.
    pub children: Vec<TestSuite>,
    /// Test cases in this suite.
    pub test_cases: Vec<TestCase>,
}

/// A key/value property on a suite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSuiteProperty {
    /// Property name.
    pub name: String,
    /// Property value.
    pub value: String,
}

/// A single test case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestCase {
    /// Case name.
    pub name: String,
    /// Case duration in seconds.
    pub duration_seconds: f64,
    /// Failure output, present when the case failed.
    pub failure_output: Option<FailureOutput>,
    /// Skip message, present when the case was skipped.
    pub skip_message: Option<String>,
    /// Combined output of the case.
    pub system_out: Option<String>,
}

/// Failure detail for a failed case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutput {
    /// The failure text.
    pub output: String,
}

impl TestSuite {
    /// Recursively sorts properties, children, and test cases by name.
    pub fn sort(&mut self) {
        self.properties.sort_by(|a, b| a.name.cmp(&b.name));
        self.children.sort_by(|a, b| a.name.cmp(&b.name));
        self.test_cases.sort_by(|a, b| a.name.cmp(&b.name));
        for child in &mut self.children {
            child.sort();
        }
    }

    /// Censors all output carried by this suite, recursively.
    pub fn censor(&mut self, censor: &DynamicCensor) {
        for case in &mut self.test_cases {
            if let Some(failure) = &mut case.failure_output {
                failure.output = censor.censor_str(&failure.output);
            }
            if let Some(out) = &mut case.system_out {
                *out = censor.censor_str(out);
            }
            if let Some(msg) = &mut case.skip_message {
                *msg = censor.censor_str(msg);
            }
        }
        for child in &mut self.children {
            child.censor(censor);
        }
    }
}

impl TestSuites {
    /// Sorts suites by name and each suite recursively, then censors all
    /// output, producing the canonical serialized document.
    pub fn serialize(&mut self, censor: &DynamicCensor) -> Result<Vec<u8>, JunitError> {
        self.suites.sort_by(|a, b| a.name.cmp(&b.name));
        for suite in &mut self.suites {
            suite.censor(censor);
            suite.sort();
        }

        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None))).map_err(xml_err)?;
        writer.write_event(Event::Start(BytesStart::new("testsuites"))).map_err(xml_err)?;
        for suite in &self.suites {
            write_suite(&mut writer, suite)?;
        }
        writer.write_event(Event::End(BytesEnd::new("testsuites"))).map_err(xml_err)?;
        Ok(writer.into_inner().into_inner())
    }
}

fn write_suite(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    suite: &TestSuite,
) -> Result<(), JunitError> {
    let mut start = BytesStart::new("testsuite");
    start.push_attribute(("name", suite.name.as_str()));
    start.push_attribute(("tests", suite.num_tests.to_string().as_str()));
    start.push_attribute(("failures", suite.num_failed.to_string().as_str()));
    start.push_attribute(("time", format_seconds(suite.duration_seconds).as_str()));
    writer.write_event(Event::Start(start)).map_err(xml_err)?;

    if !suite.properties.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("properties"))).map_err(xml_err)?;
        for property in &suite.properties {
            let mut el = BytesStart::new("property");
            el.push_attribute(("name", property.name.as_str()));
            el.push_attribute(("value", property.value.as_str()));
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("properties"))).map_err(xml_err)?;
    }

    for child in &suite.children {
        write_suite(writer, child)?;
    }

    for case in &suite.test_cases {
        let mut el = BytesStart::new("testcase");
        el.push_attribute(("name", case.name.as_str()));
        el.push_attribute(("time", format_seconds(case.duration_seconds).as_str()));
        let empty = case.failure_output.is_none()
            && case.skip_message.is_none()
            && case.system_out.is_none();
        if empty {
            writer.write_event(Event::Empty(el)).map_err(xml_err)?;
            continue;
        }
        writer.write_event(Event::Start(el)).map_err(xml_err)?;
        if let Some(failure) = &case.failure_output {
            writer.write_event(Event::Start(BytesStart::new("failure"))).map_err(xml_err)?;
            writer.write_event(Event::Text(BytesText::new(&failure.output))).map_err(xml_err)?;
            writer.write_event(Event::End(BytesEnd::new("failure"))).map_err(xml_err)?;
        }
        if let Some(message) = &case.skip_message {
            let mut skipped = BytesStart::new("skipped");
            skipped.push_attribute(("message", message.as_str()));
            writer.write_event(Event::Empty(skipped)).map_err(xml_err)?;
        }
        if let Some(out) = &case.system_out {
            writer.write_event(Event::Start(BytesStart::new("system-out"))).map_err(xml_err)?;
            writer.write_event(Event::Text(BytesText::new(out))).map_err(xml_err)?;
            writer.write_event(Event::End(BytesEnd::new("system-out"))).map_err(xml_err)?;
        }
        writer.write_event(Event::End(BytesEnd::new("testcase"))).map_err(xml_err)?;
    }

    writer.write_event(Event::End(BytesEnd::new("testsuite"))).map_err(xml_err)?;
    Ok(())
}

fn format_seconds(seconds: f64) -> String {
    format!("{seconds:.3}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(name: &str) -> TestCase {
        TestCase {
            name: name.to_string(),
            ..TestCase::default()
        }
    }

    #[test]
    fn sorts_recursively_by_name() {
        let mut suite = TestSuite {
            name: "outer".to_string(),
            properties: vec![
                TestSuiteProperty { name: "b".into(), value: "2".into() },
                TestSuiteProperty { name: "a".into(), value: "1".into() },
            ],
            children: vec![
                TestSuite { name: "z".into(), test_cases: vec![case("2"), case("1")], ..TestSuite::default() },
                TestSuite { name: "a".into(), ..TestSuite::default() },
            ],
            test_cases: vec![case("beta"), case("alpha")],
            ..TestSuite::default()
        };
        suite.sort();

        assert_eq!(suite.properties[0].name, "a");
        assert_eq!(suite.children[0].name, "a");
        assert_eq!(suite.children[1].test_cases[0].name, "1");
        assert_eq!(suite.test_cases[0].name, "alpha");
    }

    #[test]
    fn serializes_censored_output() {
        let censor = DynamicCensor::new();
        censor.add_secrets(["s3cr3t"]);
        let mut suites = TestSuites {
            suites: vec![TestSuite {
                name: "job".into(),
                num_tests: 1,
                num_failed: 1,
                test_cases: vec![TestCase {
                    name: "initialize".into(),
                    failure_output: Some(FailureOutput { output: "leaked s3cr3t here".into() }),
                    ..TestCase::default()
                }],
                ..TestSuite::default()
            }],
        };
        let xml = String::from_utf8(suites.serialize(&censor).unwrap()).unwrap();
        assert!(xml.contains("CENSORED"), "{xml}");
        assert!(!xml.contains("s3cr3t"), "{xml}");
        assert!(xml.contains("<testsuite name=\"job\""), "{xml}");
    }

    #[test]
    fn serialization_is_deterministic() {
        let censor = DynamicCensor::new();
        let build = || TestSuites {
            suites: vec![
                TestSuite { name: "b".into(), ..TestSuite::default() },
                TestSuite { name: "a".into(), ..TestSuite::default() },
            ],
        };
        let first = build().serialize(&censor).unwrap();
        let second = build().serialize(&censor).unwrap();
        assert_eq!(first, second);
    }
}
