//! Stage Schema Registry
//!
//! Static table of the nine recognised processing stages and the base lot
//! schema. Every field carries:
//!
//! - `key`  : the key the ledger stores the value under (e.g. `metodoSecado`)
//! - `name` : the English identifier (e.g. `dryingMethod`)
//! - `label`: the Spanish label shown to operators
//! - `input`: `text` or `date`
//!
//! Callers may address a field by either `key` or `name`; everything past
//! [`FieldSet::resolve`] works with store keys only.
//!
//! Pipeline order is presentational. No stage depends on another.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Map of store key → value, the unit every stage and lot write carries.
pub type FieldMap = std::collections::BTreeMap<String, String>;

/// Kind of input widget a front end should render for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Text,
    Date,
}

/// One field of a stage or lot schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub label: &'static str,
    pub input: InputKind,
    pub required: bool,
}

const fn text(key: &'static str, name: &'static str, label: &'static str) -> FieldSpec {
    FieldSpec {
        key,
        name,
        label,
        input: InputKind::Text,
        required: true,
    }
}

const fn date(key: &'static str, name: &'static str, label: &'static str) -> FieldSpec {
    FieldSpec {
        key,
        name,
        label,
        input: InputKind::Date,
        required: true,
    }
}

/// An ordered list of fields with a title; shared by stages and the base lot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSet {
    pub title: &'static str,
    pub fields: &'static [FieldSpec],
}

impl FieldSet {
    /// Store keys of the required fields, in schema order.
    pub fn required_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().filter(|f| f.required).map(|f| f.key)
    }

    /// Store keys of all fields, in schema order.
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.key)
    }

    /// Look a field up by store key or English name.
    pub fn resolve(&self, key_or_name: &str) -> Option<&'static FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.key == key_or_name || f.name == key_or_name)
    }

    /// Serializable description: `{title, fields, required_fields}`.
    pub fn describe(&self) -> SchemaDescription {
        SchemaDescription {
            title: self.title,
            fields: self.fields.to_vec(),
            required_fields: self.required_fields().collect(),
        }
    }
}

/// Wire/CLI form of a schema lookup.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDescription {
    pub title: &'static str,
    pub fields: Vec<FieldSpec>,
    pub required_fields: Vec<&'static str>,
}

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

/// The nine processing stages, in presentational pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    #[serde(rename = "cosecha")]
    Cosecha,
    #[serde(rename = "despulpado")]
    Despulpado,
    #[serde(rename = "fermentacion")]
    Fermentacion,
    #[serde(rename = "lavado")]
    Lavado,
    #[serde(rename = "secado")]
    Secado,
    #[serde(rename = "clasificacionGrano")]
    ClasificacionGrano,
    #[serde(rename = "trillado")]
    Trillado,
    #[serde(rename = "empaque")]
    Empaque,
    #[serde(rename = "impacto")]
    Impacto,
}

impl StageKind {
    pub const ALL: [StageKind; 9] = [
        StageKind::Cosecha,
        StageKind::Despulpado,
        StageKind::Fermentacion,
        StageKind::Lavado,
        StageKind::Secado,
        StageKind::ClasificacionGrano,
        StageKind::Trillado,
        StageKind::Empaque,
        StageKind::Impacto,
    ];

    /// Key the stage is stored under on the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosecha => "cosecha",
            Self::Despulpado => "despulpado",
            Self::Fermentacion => "fermentacion",
            Self::Lavado => "lavado",
            Self::Secado => "secado",
            Self::ClasificacionGrano => "clasificacionGrano",
            Self::Trillado => "trillado",
            Self::Empaque => "empaque",
            Self::Impacto => "impacto",
        }
    }

    /// Schema for this stage.
    pub fn schema(&self) -> &'static FieldSet {
        get_schema(*self)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stage name that matches none of the nine stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStage(pub String);

impl fmt::Display for UnknownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stage '{}'", self.0)
    }
}

impl std::error::Error for UnknownStage {}

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Static tables
// ---------------------------------------------------------------------------

const COSECHA: FieldSet = FieldSet {
    title: "Datos de cosecha",
    fields: &[
        text("nombreCaficultor", "farmerName", "Nombre del caficultor"),
        text("ubicacion", "location", "Ubicación"),
        text("tamanoFinca", "farmSize", "Tamaño de la finca"),
        text("variedadesCultivadas", "varietiesGrown", "Variedades cultivadas"),
        text("altitudCultivo", "altitude", "Altitud de cultivo"),
        date("fechaCosecha", "harvestDate", "Fecha de cosecha"),
        text("metodoCosecha", "harvestMethod", "Método de cosecha"),
        text("cantidadCosechada", "harvestedQuantity", "Cantidad cosechada"),
    ],
};

const DESPULPADO: FieldSet = FieldSet {
    title: "Datos de despulpado",
    fields: &[
        text("metodoDespulpado", "pulpingMethod", "Método de despulpado"),
        date("fechaProceso", "processDate", "Fecha del proceso de despulpado"),
        text("cantidadPulpaRetirada", "pulpRemoved", "Cantidad de pulpa retirada"),
        text("destinoPulpa", "pulpDestination", "Destino de la pulpa"),
    ],
};

const FERMENTACION: FieldSet = FieldSet {
    title: "Datos de fermentación",
    fields: &[
        text("duracionFermentacion", "fermentationDuration", "Duración de la fermentación"),
        text("temperaturaPromedio", "avgTemperature", "Temperatura promedio"),
        text("metodoFermentacion", "fermentationMethod", "Método de fermentación"),
        date("fechaFermentacion", "fermentationDate", "Fecha de fermentación"),
    ],
};

const LAVADO: FieldSet = FieldSet {
    title: "Datos de lavado",
    fields: &[
        text("volumenAguaUtilizada", "waterVolumeUsed", "Volumen de agua utilizada"),
        text("metodoReciclajeAgua", "waterRecyclingMethod", "Método de reciclaje de agua"),
        text("cantidadAguaReutilizada", "waterReused", "Cantidad de agua reutilizada"),
        date("fechaLavado", "washDate", "Fecha del lavado"),
    ],
};

const SECADO: FieldSet = FieldSet {
    title: "Datos de secado",
    fields: &[
        text("metodoSecado", "dryingMethod", "Método de secado"),
        text("humedadFinal", "finalMoisture", "Humedad final del grano"),
        date("fechaSecado", "dryingDate", "Fecha de secado"),
    ],
};

const CLASIFICACION_GRANO: FieldSet = FieldSet {
    title: "Clasificación del grano",
    fields: &[
        text("metodoClasificacion", "classificationMethod", "Método de clasificación"),
        text("criteriosSeleccion", "selectionCriteria", "Criterios de selección"),
        text("porcentajeImpurezas", "impurityPercentage", "Porcentaje de impurezas"),
        date("fechaClasificacion", "classificationDate", "Fecha de clasificación"),
    ],
};

const TRILLADO: FieldSet = FieldSet {
    title: "Datos de trillado",
    fields: &[
        date("fechaTrillado", "millingDate", "Fecha de trillado"),
        text("cantidadTrillada", "milledQuantity", "Cantidad de café trillado"),
    ],
};

const EMPAQUE: FieldSet = FieldSet {
    title: "Datos de empaque",
    fields: &[
        text("tipoEmpaque", "packagingType", "Tipo de empaque"),
        text("pesoLote", "lotWeight", "Peso del lote"),
        date("fechaEmpaque", "packagingDate", "Fecha de empaque"),
    ],
};

const IMPACTO: FieldSet = FieldSet {
    title: "Impacto social y ambiental",
    fields: &[
        text("ayudaFamilias", "familiesHelped", "Ayuda a familias de caficultores"),
        text("pagoSobrePromedio", "abovePriceAvg", "Pago sobre el promedio"),
        text("reduccionPesticidas", "pesticideReduction", "Reducción de pesticidas"),
        text("usoComposta", "compostUse", "Uso de composta"),
        date("fechaImpacto", "impactDate", "Fecha del impacto"),
    ],
};

/// Base attributes captured once, at lot creation.
pub const LOT_SCHEMA: FieldSet = FieldSet {
    title: "Crear lote de café",
    fields: &[
        text("producto", "productName", "Nombre del producto"),
        text("caficultor", "farmerName", "Nombre del caficultor o cooperativa"),
        text("origen", "farmLocation", "Ubicación de la finca"),
        text("tamanoFinca", "farmSize", "Tamaño de la finca"),
        text("variedad", "variety", "Variedad cultivada"),
        text("altitud", "altitude", "Altitud de cultivos"),
        text("metodoCosecha", "harvestMethod", "Método de cosechado"),
        date("fechaCosecha", "harvestDate", "Fecha de cosecha"),
        text("cantidad", "quantity", "Cantidad cosechada"),
    ],
};

/// Schema for a stage. Pure lookup.
pub fn get_schema(stage: StageKind) -> &'static FieldSet {
    match stage {
        StageKind::Cosecha => &COSECHA,
        StageKind::Despulpado => &DESPULPADO,
        StageKind::Fermentacion => &FERMENTACION,
        StageKind::Lavado => &LAVADO,
        StageKind::Secado => &SECADO,
        StageKind::ClasificacionGrano => &CLASIFICACION_GRANO,
        StageKind::Trillado => &TRILLADO,
        StageKind::Empaque => &EMPAQUE,
        StageKind::Impacto => &IMPACTO,
    }
}

/// Schema lookup by stage name; unknown names fail with [`UnknownStage`].
pub fn get_schema_by_name(stage: &str) -> Result<&'static FieldSet, UnknownStage> {
    stage.parse::<StageKind>().map(get_schema)
}
