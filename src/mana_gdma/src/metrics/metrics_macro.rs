/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

/// Static metadata every metric variant carries.
pub(crate) trait NamedMetric {
    /// Name exported to the metrics recorder
    fn name(&self) -> &'static str;
    /// Help text
    fn description(&self) -> &'static str;
    fn unit(&self) -> metrics::Unit;
}

/// Declares metric enums. Each variant maps to one exported metric; its fields
/// become the values and labels recorded at emission time.
macro_rules! define_metrics {
    (
        $(
            $metric_type:ident {
                $(
                    $(#[$vmeta:meta])*
                    $variant:ident $( { $($field_name:ident : $field_ty:ty),* $(,)? } )? => {
                        name: $name:expr,
                        description: $description:expr,
                        unit: $unit:expr $(,)?
                    }
                ),* $(,)?
            }
        )*
    ) => {
        $(
            #[derive(Debug, Clone)]
            pub(crate) enum $metric_type {
                $(
                    $(#[$vmeta])*
                    $variant $( { $($field_name : $field_ty),* } )?
                ),*
            }

            impl $metric_type {
                /// Names of all metrics of this kind
                #[allow(dead_code)]
                pub(crate) const NAMES: &'static [&'static str] = &[$($name),*];
            }

            impl $crate::metrics::metrics_macro::NamedMetric for $metric_type {
                fn name(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $name, )*
                    }
                }

                fn description(&self) -> &'static str {
                    match self {
                        $( Self::$variant { .. } => $description, )*
                    }
                }

                fn unit(&self) -> metrics::Unit {
                    match self {
                        $( Self::$variant { .. } => $unit, )*
                    }
                }
            }
        )*
    };
}
