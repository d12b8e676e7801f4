//! Rendering [`InterfaceInfo`] into the D-Bus introspection XML format.

use std::fmt::Write;

use crate::signature::Signature;

use super::{
    ArgInfo, InterfaceInfo, MethodInfo, PropertyInfo, SignalInfo, INTROSPECTABLE, PEER, PROPERTIES,
};

const DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// The standard interfaces the adapter provides on every exported object.
pub(crate) fn standard_interfaces() -> Vec<InterfaceInfo> {
    let s = || Signature::parse("s").expect("valid signature");
    let v = || Signature::parse("v").expect("valid signature");

    vec![
        InterfaceInfo::new(PEER)
            .with_method(MethodInfo::new("Ping"))
            .with_method(
                MethodInfo::new("GetMachineId")
                    .with_out_arg(ArgInfo::new("machine_uuid", s())),
            ),
        InterfaceInfo::new(PROPERTIES)
            .with_method(
                MethodInfo::new("Get")
                    .with_in_arg(ArgInfo::new("interface_name", s()))
                    .with_in_arg(ArgInfo::new("property_name", s()))
                    .with_out_arg(ArgInfo::new("value", v())),
            )
            .with_method(
                MethodInfo::new("Set")
                    .with_in_arg(ArgInfo::new("interface_name", s()))
                    .with_in_arg(ArgInfo::new("property_name", s()))
                    .with_in_arg(ArgInfo::new("value", v())),
            )
            .with_method(
                MethodInfo::new("GetAll")
                    .with_in_arg(ArgInfo::new("interface_name", s()))
                    .with_out_arg(ArgInfo::new(
                        "props",
                        Signature::parse("a{sv}").expect("valid signature"),
                    )),
            )
            .with_signal(
                SignalInfo::new("PropertiesChanged")
                    .with_arg(ArgInfo::new("interface_name", s()))
                    .with_arg(ArgInfo::new(
                        "changed_properties",
                        Signature::parse("a{sv}").expect("valid signature"),
                    ))
                    .with_arg(ArgInfo::new(
                        "invalidated_properties",
                        Signature::parse("as").expect("valid signature"),
                    )),
            ),
        InterfaceInfo::new(INTROSPECTABLE).with_method(
            MethodInfo::new("Introspect").with_out_arg(ArgInfo::new("xml_data", s())),
        ),
    ]
}

/// Render interface descriptions into an introspection document.
pub(crate) fn to_xml(interfaces: &[InterfaceInfo]) -> String {
    let mut out = String::from(DOCTYPE);
    out.push_str("<node>\n");

    for interface in interfaces {
        write_interface(&mut out, interface);
    }

    out.push_str("</node>\n");
    out
}

fn write_interface(out: &mut String, interface: &InterfaceInfo) {
    let _ = writeln!(out, " <interface name=\"{}\">", escape(&interface.name));

    for method in &interface.methods {
        let _ = writeln!(out, "  <method name=\"{}\">", escape(&method.name));
        write_args(out, &method.in_args, Some("in"));
        write_args(out, &method.out_args, Some("out"));
        out.push_str("  </method>\n");
    }

    for property in &interface.properties {
        write_property(out, property);
    }

    for signal in &interface.signals {
        let _ = writeln!(out, "  <signal name=\"{}\">", escape(&signal.name));
        write_args(out, &signal.args, None);
        out.push_str("  </signal>\n");
    }

    out.push_str(" </interface>\n");
}

fn write_args(out: &mut String, args: &[ArgInfo], direction: Option<&str>) {
    for arg in args {
        out.push_str("   <arg");

        if let Some(name) = &arg.name {
            let _ = write!(out, " name=\"{}\"", escape(name));
        }

        let _ = write!(out, " type=\"{}\"", escape(arg.signature.as_str()));

        if let Some(direction) = direction {
            let _ = write!(out, " direction=\"{direction}\"");
        }

        out.push_str("/>\n");
    }
}

fn write_property(out: &mut String, property: &PropertyInfo) {
    let _ = writeln!(
        out,
        "  <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
        escape(&property.name),
        escape(property.signature.as_str()),
        property.access.as_str(),
    );
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }

    out
}
