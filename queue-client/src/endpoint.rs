//! Endpoint descriptors and the pure parts of an invocation: argument
//! binding, hidden-state insertion, output filtering and reduction, and the
//! cancellation plan.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ClientError, ClientResult};
use crate::protocol::Protocol;
use crate::schema::{ApiInfo, AppConfig, AppVersion, ParameterInfo};

/// Component types that never take part in the public API.
pub const SKIP_COMPONENTS: &[&str] = &[
    "state",
    "row",
    "column",
    "tabs",
    "tab",
    "tabitem",
    "box",
    "form",
    "accordion",
    "group",
    "interpretation",
    "dataset",
    "sidebar",
];

/// Final value of a job after reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Output {
    Single(JsonValue),
    Multiple(Vec<JsonValue>),
}

impl Output {
    pub fn as_single(&self) -> Option<&JsonValue> {
        match self {
            Output::Single(value) => Some(value),
            Output::Multiple(_) => None,
        }
    }

    pub fn into_value(self) -> JsonValue {
        match self {
            Output::Single(value) => value,
            Output::Multiple(values) => JsonValue::Array(values),
        }
    }
}

/// How one input or output slot is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentApiType {
    pub skip: bool,
    pub value_is_file: bool,
    pub is_state: bool,
}

impl ComponentApiType {
    fn resolve(config: &AppConfig, component_id: i64) -> ClientResult<Self> {
        let component = config.component(component_id).ok_or_else(|| {
            ClientError::Config(format!("Unknown component id: {}", component_id))
        })?;
        let ty = component.component_type.to_lowercase();
        let skip = component.skip_api || SKIP_COMPONENTS.contains(&ty.as_str());
        let value_is_file = component
            .api_info
            .as_ref()
            .map(|info| info.to_string().contains("FileData"))
            .unwrap_or(false);
        Ok(Self {
            skip,
            value_is_file,
            is_state: ty == "state",
        })
    }
}

/// Best-effort remote cancellation, decided once per endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelPlan {
    /// `POST cancel` with the job's event id.
    Direct,
    /// Trigger the dependency that cancels this one. `also_cancels` lists the
    /// api names of other endpoints it stops as well.
    ViaDependency {
        fn_index: usize,
        also_cancels: Vec<String>,
    },
    /// Nothing on the server cancels this endpoint.
    Unsupported,
}

impl CancelPlan {
    pub fn for_endpoint(config: &AppConfig, version: AppVersion, fn_index: usize) -> Self {
        if version.supports_direct_cancel() {
            return CancelPlan::Direct;
        }
        let target = fn_index as i64;
        let candidate = config
            .dependencies
            .iter()
            .enumerate()
            .filter(|(_, dep)| dep.cancels.contains(&target))
            .map(|(i, dep)| {
                let others: Vec<i64> =
                    dep.cancels.iter().copied().filter(|c| *c != target).collect();
                (i, others)
            })
            .min_by_key(|(_, others)| others.len());

        match candidate {
            None => CancelPlan::Unsupported,
            Some((index, others)) => CancelPlan::ViaDependency {
                fn_index: index,
                also_cancels: others
                    .iter()
                    .filter_map(|i| usize::try_from(*i).ok())
                    .filter_map(|i| config.dependencies.get(i))
                    .map(|dep| format!("/{}", dep.name().unwrap_or("")))
                    .collect(),
            },
        }
    }

    /// Warning shown when cancelling, if the plan is imprecise.
    pub fn warning(&self) -> Option<String> {
        match self {
            CancelPlan::Direct => None,
            CancelPlan::ViaDependency { also_cancels, .. } if also_cancels.is_empty() => None,
            CancelPlan::ViaDependency { also_cancels, .. } => Some(format!(
                "Cancelling this job will also cancel any jobs for {} that are currently running.",
                also_cancels.join(", ")
            )),
            CancelPlan::Unsupported => Some(
                "Cancelling this job will not stop the server from running. An event that \
                 cancels this one must be added to the upstream app, or the app must run \
                 version 4.29.0 or later."
                    .to_string(),
            ),
        }
    }
}

/// Static description of one remote endpoint.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub fn_index: usize,
    /// Name with a leading slash, `None` for unnamed endpoints.
    pub api_name: Option<String>,
    pub protocol: Protocol,
    pub input_types: Vec<ComponentApiType>,
    pub output_types: Vec<ComponentApiType>,
    /// Parameter info, when the app publishes it for this endpoint.
    pub parameters: Option<Vec<ParameterInfo>>,
    pub is_valid: bool,
    pub backend_fn: bool,
    pub show_api: bool,
    pub cancel_plan: CancelPlan,
}

impl EndpointDescriptor {
    /// Build the descriptor for the dependency at `position`.
    pub fn from_config(
        config: &AppConfig,
        info: Option<&ApiInfo>,
        position: usize,
        protocol: Protocol,
    ) -> ClientResult<Self> {
        let dependency = config.dependencies.get(position).ok_or_else(|| {
            ClientError::Config(format!("Invalid function index: {}", position))
        })?;
        let fn_index = dependency
            .id
            .and_then(|id| usize::try_from(id).ok())
            .unwrap_or(position);
        let api_name = dependency.name().map(|name| format!("/{}", name));
        let input_types = dependency
            .inputs
            .iter()
            .map(|id| ComponentApiType::resolve(config, *id))
            .collect::<ClientResult<Vec<_>>>()?;
        let output_types = dependency
            .outputs
            .iter()
            .map(|id| ComponentApiType::resolve(config, *id))
            .collect::<ClientResult<Vec<_>>>()?;
        let parameters = info
            .and_then(|info| info.endpoint(dependency.name(), fn_index))
            .map(|endpoint| endpoint.parameters.clone());

        Ok(Self {
            fn_index,
            api_name,
            protocol,
            input_types,
            output_types,
            parameters,
            is_valid: dependency.is_valid(),
            backend_fn: dependency.backend_fn,
            show_api: dependency.show_api,
            cancel_plan: CancelPlan::for_endpoint(config, config.app_version(), fn_index),
        })
    }

    /// Bind positional and keyword arguments to the endpoint's parameters.
    pub fn construct_args(
        &self,
        args: Vec<JsonValue>,
        kwargs: &IndexMap<String, JsonValue>,
    ) -> ClientResult<Vec<JsonValue>> {
        let Some(parameters) = &self.parameters else {
            if !kwargs.is_empty() {
                return Err(ClientError::Config(
                    "This endpoint does not support key-word arguments. Please pass \
                     positional arguments instead."
                        .to_string(),
                ));
            }
            return Ok(args);
        };

        let mut slots: Vec<Option<JsonValue>> = parameters
            .iter()
            .map(|p| {
                if p.parameter_has_default {
                    Some(p.parameter_default.clone().unwrap_or(JsonValue::Null))
                } else {
                    None
                }
            })
            .collect();

        let positional = args.len();
        if positional > slots.len() {
            slots.resize(positional, None);
        }
        for (slot, arg) in slots.iter_mut().zip(args) {
            *slot = Some(arg);
        }

        for (name, value) in kwargs {
            let index = parameters
                .iter()
                .position(|p| p.parameter_name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| {
                    ClientError::Config(format!("Parameter `{}` is not a valid key-word argument", name))
                })?;
            if index < positional {
                return Err(ClientError::Config(format!(
                    "Parameter `{}` is already set as a positional argument",
                    name
                )));
            }
            slots[index] = Some(value.clone());
        }

        let missing: Vec<String> = slots
            .iter()
            .zip(parameters.iter())
            .filter(|(slot, _)| slot.is_none())
            .map(|(_, p)| {
                p.parameter_name
                    .clone()
                    .or_else(|| p.label.clone())
                    .unwrap_or_default()
            })
            .collect();
        if !missing.is_empty() {
            return Err(ClientError::Config(format!(
                "No value provided for required argument: {}",
                missing.join(", ")
            )));
        }

        Ok(slots.into_iter().map(|s| s.unwrap_or(JsonValue::Null)).collect())
    }

    /// Insert `null` for each hidden state input.
    pub fn insert_empty_state(&self, mut data: Vec<JsonValue>) -> Vec<JsonValue> {
        for (i, ty) in self.input_types.iter().enumerate() {
            if ty.is_state {
                let at = i.min(data.len());
                data.insert(at, JsonValue::Null);
            }
        }
        data
    }

    pub fn remove_skipped_components(&self, data: Vec<JsonValue>) -> Vec<JsonValue> {
        data.into_iter()
            .zip(self.output_types.iter())
            .filter(|(_, ty)| !ty.skip)
            .map(|(value, _)| value)
            .collect()
    }

    /// Number of output slots visible to the caller.
    pub fn effective_output_count(&self, skip_components: bool) -> usize {
        if skip_components {
            self.output_types.iter().filter(|ty| !ty.skip).count()
        } else {
            self.output_types.len()
        }
    }

    /// Collapse outputs to a bare value when exactly one slot is visible.
    pub fn reduce_singleton_output(&self, mut data: Vec<JsonValue>, skip_components: bool) -> Output {
        if self.effective_output_count(skip_components) == 1 {
            Output::Single(if data.is_empty() {
                JsonValue::Null
            } else {
                data.swap_remove(0)
            })
        } else {
            Output::Multiple(data)
        }
    }

    /// Filter and reduce raw output data.
    pub fn finalize_outputs(&self, data: Vec<JsonValue>, skip_components: bool) -> Output {
        let data = if skip_components {
            self.remove_skipped_components(data)
        } else {
            data
        };
        self.reduce_singleton_output(data, skip_components)
    }

    /// Whether the default selection may pick this endpoint.
    pub fn is_default_candidate(&self) -> bool {
        self.is_valid && self.api_name.is_some() && self.backend_fn && self.show_api
    }
}
