//! Models of the hardware objects exposed by a drm device.
//!
//! The inventory mirrors the kernel's object graph: [`Connector`]s,
//! [`Crtc`]s and [`Plane`]s, each identified by their stable kernel
//! handle. Pipelines and outputs reference these objects by handle only,
//! so hot-unplug can never leave dangling references behind.
//!
//! Everything in the atomic api is set via properties and the property
//! name to handle mapping is not consistent across devices, so each
//! object caches its own name lookup table on creation.

use std::collections::HashMap;

use drm::control::{property, Device as ControlDevice, ResourceHandle};

use crate::error::{AccessError, Error};
use crate::fd::DevPath;

mod connector;
mod crtc;
mod plane;

pub use connector::{Connector, EncoderCaps};
pub use crtc::Crtc;
pub use plane::Plane;

/// Cached property name to handle mapping of a single hardware object.
pub(crate) type PropMap = HashMap<String, property::Handle>;

/// Builds the property name lookup table for one object.
pub(crate) fn map_props<D, T>(fd: &D, handle: T) -> Result<PropMap, Error>
where
    D: DevPath + ControlDevice,
    T: ResourceHandle,
{
    let props = fd.get_properties(handle).map_err(|source| {
        Error::Access(AccessError {
            errmsg: "Error reading properties",
            dev: fd.dev_path(),
            source,
        })
    })?;

    let mut map = HashMap::new();
    let (prop_handles, _) = props.as_props_and_values();
    for prop in prop_handles {
        if let Ok(info) = fd.get_property(*prop) {
            let name = info.name().to_string_lossy().into_owned();
            map.insert(name, *prop);
        }
    }
    Ok(map)
}

/// Reads the current value of a property by name, decoded by its type.
pub(crate) fn read_prop<D, T, R>(
    fd: &D,
    handle: T,
    name: &str,
    decode: impl Fn(property::Value<'_>) -> Option<R>,
) -> Option<R>
where
    D: ControlDevice,
    T: ResourceHandle,
{
    let props = fd.get_properties(handle).ok()?;
    props.into_iter().find_map(|(prop, value)| {
        let info = fd.get_property(prop).ok()?;
        if info.name().to_str() == Ok(name) {
            decode(info.value_type().convert_value(value))
        } else {
            None
        }
    })
}

pub(crate) fn prop_handle<T: ResourceHandle + Into<drm::control::RawResourceHandle>>(
    map: &PropMap,
    handle: T,
    name: &'static str,
) -> Result<property::Handle, Error> {
    map.get(name)
        .copied()
        .ok_or(Error::UnknownProperty {
            handle: handle.into(),
            name,
        })
}
