//! Libvirt domain XML parsing.
//!
//! Extracts identity, cloud labels and attached disks from `virsh dumpxml`
//! output using a streaming reader.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::domain::{DiskSource, DomainRef, UNKNOWN_LABEL};
use crate::{Error, Result};

/// Namespace of the OpenStack Nova instance metadata block.
pub const NOVA_NS: &str = "http://openstack.org/xmlns/libvirt/nova/1.1";

#[derive(Default)]
struct DiskBuilder {
    format: Option<String>,
    file: Option<String>,
    protocol: Option<String>,
    name: Option<String>,
    hosts: Vec<String>,
    username: Option<String>,
    target: String,
}

impl DiskBuilder {
    fn location(&self) -> Option<String> {
        if let Some(file) = &self.file {
            return Some(file.clone());
        }
        let protocol = self.protocol.as_deref()?;
        let name = self.name.as_deref()?;
        let user = self
            .username
            .as_deref()
            .map(|u| format!("{u}@"))
            .unwrap_or_default();
        Some(match self.hosts.first() {
            Some(host) => format!("{protocol}://{user}{host}/{name}"),
            None => format!("{protocol}://{user}/{name}"),
        })
    }

    fn build(self) -> Option<DiskSource> {
        let location = self.location()?;
        Some(DiskSource {
            location,
            format: self.format,
            target: self.target,
        })
    }
}

fn attr(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| Error::parse("domain xml", err.to_string()))?;
        if a.key.as_ref() == key.as_bytes() {
            let value = a
                .unescape_value()
                .map_err(|err| Error::parse("domain xml", err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn nova_prefix(e: &BytesStart<'_>) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.map_err(|err| Error::parse("domain xml", err.to_string()))?;
        let key = a.key.as_ref();
        if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            let value = a
                .unescape_value()
                .map_err(|err| Error::parse("domain xml", err.to_string()))?;
            if value == NOVA_NS {
                return Ok(Some(String::from_utf8_lossy(prefix).into_owned()));
            }
        }
    }
    Ok(None)
}

/// Element-level state for one parse.
#[derive(Default)]
struct DomainXml {
    stack: Vec<String>,
    name: Option<String>,
    uuid: Option<String>,
    nova: Option<String>,
    display_name: Option<String>,
    project: Option<String>,
    disk: Option<DiskBuilder>,
    disks: Vec<DiskSource>,
}

impl DomainXml {
    fn parent(&self) -> Option<&str> {
        self.stack.last().map(String::as_str)
    }

    fn is_nova(&self, qname: &str, local: &str) -> bool {
        match &self.nova {
            Some(prefix) => qname
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix(':'))
                == Some(local),
            None => false,
        }
    }

    /// Handle an opening or self-closing element.
    fn element(&mut self, e: &BytesStart<'_>) -> Result<()> {
        let qname = String::from_utf8_lossy(e.name().as_ref()).into_owned();

        if self.nova.is_none() {
            self.nova = nova_prefix(e)?;
        }

        match qname.as_str() {
            "disk" if self.parent() == Some("devices") => {
                let device = attr(e, "device")?.unwrap_or_else(|| "disk".to_string());
                if device == "disk" {
                    self.disk = Some(DiskBuilder::default());
                }
            }
            "driver" if self.parent() == Some("disk") => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.format = attr(e, "type")?;
                }
            }
            "source" if self.parent() == Some("disk") => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.file = match attr(e, "file")? {
                        Some(f) => Some(f),
                        None => attr(e, "dev")?,
                    };
                    disk.protocol = attr(e, "protocol")?;
                    disk.name = attr(e, "name")?;
                }
            }
            "host" if self.parent() == Some("source") => {
                if let Some(disk) = self.disk.as_mut()
                    && let Some(name) = attr(e, "name")?
                {
                    let host = match attr(e, "port")? {
                        Some(port) => format!("{name}:{port}"),
                        None => name,
                    };
                    disk.hosts.push(host);
                }
            }
            "auth" if self.parent() == Some("disk") => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.username = attr(e, "username")?;
                }
            }
            "target" if self.parent() == Some("disk") => {
                if let Some(disk) = self.disk.as_mut() {
                    disk.target = attr(e, "dev")?.unwrap_or_default();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let depth = self.stack.len();
        let Some(current) = self.stack.last().cloned() else {
            return;
        };

        if depth == 2 && self.stack[0] == "domain" {
            match current.as_str() {
                "name" => self.name = Some(text.to_string()),
                "uuid" => self.uuid = Some(text.to_string()),
                _ => {}
            }
            return;
        }

        if !self.stack.iter().any(|s| s == "metadata") {
            return;
        }
        let parent = depth
            .checked_sub(2)
            .map(|i| self.stack[i].clone())
            .unwrap_or_default();
        if self.is_nova(&current, "name") && self.is_nova(&parent, "instance") {
            self.display_name = Some(text.to_string());
        } else if self.is_nova(&current, "project") && self.is_nova(&parent, "owner") {
            self.project = Some(text.to_string());
        }
    }

    fn close(&mut self) {
        if let Some(name) = self.stack.pop()
            && name == "disk"
            && self.parent() == Some("devices")
            && let Some(disk) = self.disk.take()
            && let Some(source) = disk.build()
        {
            self.disks.push(source);
        }
    }

    fn finish(self) -> Result<DomainRef> {
        let uuid = self
            .uuid
            .ok_or_else(|| Error::parse("domain xml", "missing <uuid>"))?;
        let domain_id = uuid::Uuid::parse_str(&uuid)
            .map(|u| u.hyphenated().to_string())
            .map_err(|e| Error::parse("domain uuid", format!("{uuid}: {e}")))?;
        let name = self.name.unwrap_or_else(|| domain_id.clone());

        Ok(DomainRef {
            domain_id,
            name,
            display_name: self.display_name.unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
            project: self.project.unwrap_or_else(|| UNKNOWN_LABEL.to_string()),
            disks: self.disks,
        })
    }
}

/// Parse a libvirt domain definition into a [`DomainRef`].
///
/// Only `device="disk"` entries with a resolvable source are kept; CD-ROMs
/// and empty drives are ignored.
pub fn parse_domain_xml(xml: &str) -> Result<DomainRef> {
    let mut reader = Reader::from_str(xml);
    let mut state = DomainXml::default();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                state.element(&e)?;
                state
                    .stack
                    .push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Empty(e)) => {
                state.element(&e)?;
                // Self-closing disks never carry a source.
                if e.name().as_ref() == b"disk" {
                    state.disk = None;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::parse("domain xml", e.to_string()))?;
                state.text(&text);
            }
            Ok(Event::End(_)) => state.close(),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::parse(
                    "domain xml",
                    format!("at position {}: {e}", reader.buffer_position()),
                ));
            }
        }
    }

    state.finish()
}
