//! Maths curriculum checklist (2nd year baccalaureate).

use serde::Serialize;

use crate::err::{Error, Result};
use crate::store::Store;

pub const CHAPTER_NAME_MAX: usize = 255;

pub static OUTLINE: &[(&str, &[&str])] = &[
    (
        "1. Limites et Continuité",
        &[
            "Continuité en un point- continuité à droite - continuité à gauche",
            "Continuité sur un intervalle",
            "Image d’un intervalle",
            "Théorème des valeurs intermédiaires (T.V.I) et dichotomie",
            "Fonction réciproque",
            "Racine N-ième",
        ],
    ),
    (
        "2. Dérivabilité et Étude des Fonctions",
        &[
            "Dérivabilité en un point",
            "Interprétation géométrique du nombre dérivé",
            "Dérivabilité sur un intervalle",
            "Calcul de la dérivée",
            "Dérivée et variations",
            "Extremums d’une fonction",
            "Concavité et dérivée seconde",
            "Les branches infinies",
            "Axe de symétrie - Centre de symétrie- Fonction paire – impaire",
            "Position relative d’une courbe et d’une droite",
        ],
    ),
    (
        "3. Fonctions Primitives",
        &[
            "Les primitives",
            "Intégrale",
            "Intégration par parties",
            "Application – Aire et Volume",
        ],
    ),
    (
        "4. Fonction Logarithme",
        &[
            "Définition et propriétés (Df et Equation/Inéquation)",
            "Limites usuelles",
            "La dérivée",
            "Logarithmes de base a",
        ],
    ),
    (
        "5. Fonction Exponentielle",
        &[
            "Définition et propriétés (Df et Equation/Inéquation)",
            "Limites usuelles",
            "La dérivée",
            "Exponentielle de base a",
        ],
    ),
    (
        "6. Suites Numériques",
        &[
            "Monotonie d’une suite numérique",
            "Suite majorée – Suite minorée – Suite bornée (Récurrence)",
            "Suite arithmétique",
            "Suite géométrique",
            "Limite d’une suite numérique (Convergence)",
        ],
    ),
    (
        "7. Nombres Complexes",
        &[
            "Notion et propriétés",
            "Représentation géométrique",
            "Equations du second degré",
            "Forme trigonométrique",
            "Interprétation géométrique (Alignement, type du triangle, points circulaires)",
            "Notation exponentielle",
            "Transformations (Translation-Homothétie-Rotation)",
        ],
    ),
    (
        "8. Géométrie dans l’espace",
        &[
            "Produit scalaire et propriétés",
            "Equation d’une droite et distance",
            "Equation cartésienne d’une sphère",
            "Produit vectoriel",
            "Positions relatives d’une droite et d’une sphère",
        ],
    ),
    (
        "9. Équations Différentielles",
        &[
            "Equation Différentielle Linéaire du 1er ordre",
            "Equation Différentielle Linéaire du 2nd ordre",
        ],
    ),
    (
        "10. Probabilités et Statistiques",
        &[
            "Introduction Cardinal - principe fondamental de dénombrement - Types de tirages",
            "Probabilité d’un événement - Probabilité conditionnelle",
            "Variables aléatoires - Loi Binomiale",
        ],
    ),
];

#[derive(Debug, Clone, Serialize)]
pub struct Chapter {
    pub name: &'static str,
    pub topics: &'static [&'static str],
}

pub fn outline() -> Vec<Chapter> {
    OUTLINE
        .iter()
        .map(|&(name, topics)| Chapter { name, topics })
        .collect()
}

/// True for a chapter title or any topic listed under one.
pub fn is_known(entry: &str) -> bool {
    OUTLINE
        .iter()
        .any(|&(name, topics)| name == entry || topics.iter().any(|t| *t == entry))
}

pub async fn selected_chapters(store: &dyn Store, student_id: i64) -> Result<Vec<String>> {
    store.programme_selections(student_id).await
}

/// Replaces the whole selection set of a student.
pub async fn replace_selections(
    store: &dyn Store,
    student_id: i64,
    selections: &[String],
) -> Result<Vec<String>> {
    let mut chapters: Vec<String> = Vec::with_capacity(selections.len());
    for raw in selections {
        let entry = raw.trim();
        if entry.is_empty() || chapters.iter().any(|c| c == entry) {
            continue;
        }
        if entry.chars().count() > CHAPTER_NAME_MAX || !is_known(entry) {
            return Err(Error::validation(format!(
                "`{}` is not part of the programme",
                entry
            )));
        }
        chapters.push(entry.to_string());
    }
    store
        .replace_programme_selections(student_id, &chapters)
        .await?;
    log::info!(
        "Saved {} programme selections for student {}",
        chapters.len(),
        student_id
    );
    Ok(chapters)
}
